//! Search predicates shared by every backend.
//!
//! A [`SearchFilter`] is an AND of optional predicates: tenant, type set,
//! key set, key prefix. The prefix, when present, replaces the key set
//! entirely. [`LoadCriteria`] controls whether scans pay for value
//! transfer.
//!
//! The in-memory engine evaluates filters directly via
//! [`SearchFilter::matches`]; the relational engines compile the same
//! predicates into SQL. The key-prefix predicate compiles to a half-open
//! range produced by [`prefix_bounds`] so that no backend needs `LIKE`
//! pattern escaping.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// AND-of-optional-predicates over stored blobs.
///
/// An empty (default) filter matches everything in every tenant.
///
/// # Examples
///
/// ```
/// use gridstore::SearchFilter;
///
/// let filter = SearchFilter::within("n1").with_types(["t1", "t2"]);
/// assert!(filter.matches("n1", "t1", "any-key"));
/// assert!(!filter.matches("n2", "t1", "any-key"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Exact tenant match; `None` spans all tenants.
    pub network_id: Option<String>,

    /// OR-matched type set; empty means any type.
    pub types: BTreeSet<String>,

    /// OR-matched key set; empty means any key. Ignored whenever
    /// `key_prefix` is set.
    pub keys: BTreeSet<String>,

    /// Key prefix match; replaces `keys` entirely when present.
    pub key_prefix: Option<String>,
}

impl SearchFilter {
    /// A filter that matches every blob in every tenant.
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter scoped to one tenant.
    pub fn within(network_id: impl Into<String>) -> Self {
        Self { network_id: Some(network_id.into()), ..Self::default() }
    }

    /// Restricts the filter to the given types.
    #[must_use]
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the filter to the given keys.
    #[must_use]
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Restricts the filter to keys starting with `prefix`. Takes
    /// precedence over any key set.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Whether the given tenant passes the network predicate.
    pub fn matches_network(&self, network_id: &str) -> bool {
        self.network_id.as_deref().map_or(true, |want| want == network_id)
    }

    /// The effective key predicate, with prefix-wins resolution applied.
    pub fn key_predicate(&self) -> KeyPredicate<'_> {
        if let Some(prefix) = self.key_prefix.as_deref() {
            KeyPredicate::Prefix(prefix)
        } else if self.keys.is_empty() {
            KeyPredicate::Any
        } else {
            KeyPredicate::In(&self.keys)
        }
    }

    /// Evaluates the full filter against one blob's identity.
    pub fn matches(&self, network_id: &str, typ: &str, key: &str) -> bool {
        if !self.matches_network(network_id) {
            return false;
        }
        if !self.types.is_empty() && !self.types.contains(typ) {
            return false;
        }
        match self.key_predicate() {
            KeyPredicate::Any => true,
            KeyPredicate::In(keys) => keys.contains(key),
            KeyPredicate::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

/// Resolved key predicate of a [`SearchFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPredicate<'a> {
    /// No key restriction.
    Any,
    /// Key must be a member of the set.
    In(&'a BTreeSet<String>),
    /// Key must start with the prefix.
    Prefix(&'a str),
}

/// Controls whether a scan fetches value payloads.
///
/// Metadata (`type`, `key`, `version`) is always returned; skipping values
/// lets callers enumerate keys without paying for value transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCriteria {
    /// Fetch the `value` column. Defaults to `true`.
    pub load_value: bool,
}

impl LoadCriteria {
    /// Metadata-only criteria: `type`, `key` and `version` without values.
    pub fn metadata_only() -> Self {
        Self { load_value: false }
    }
}

impl Default for LoadCriteria {
    fn default() -> Self {
        Self { load_value: true }
    }
}

/// Half-open range `[lo, hi)` equivalent to "starts with `prefix`" under
/// byte-wise string comparison.
///
/// `hi` is the prefix with its last scalar value incremented (skipping the
/// surrogate gap); `None` means unbounded above, which only happens for
/// prefixes made entirely of U+10FFFF. Both SQLite's `TEXT` comparison and
/// Rust's `str` ordering compare UTF-8 bytes, and UTF-8 preserves scalar
/// order, so the range is exact for either.
pub fn prefix_bounds(prefix: &str) -> (String, Option<String>) {
    let mut scalars: Vec<char> = prefix.chars().collect();
    while let Some(last) = scalars.pop() {
        if let Some(next) = next_scalar(last) {
            scalars.push(next);
            return (prefix.to_owned(), Some(scalars.into_iter().collect()));
        }
    }
    (prefix.to_owned(), None)
}

fn next_scalar(c: char) -> Option<char> {
    let mut code = c as u32 + 1;
    if (0xD800..0xE000).contains(&code) {
        code = 0xE000;
    }
    char::from_u32(code)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SearchFilter::all();
        assert!(filter.matches("n1", "t1", "k1"));
        assert!(filter.matches("", "", ""));
    }

    #[test]
    fn network_predicate_is_exact() {
        let filter = SearchFilter::within("n1");
        assert!(filter.matches("n1", "t", "k"));
        assert!(!filter.matches("n10", "t", "k"));
    }

    #[test]
    fn types_are_or_matched() {
        let filter = SearchFilter::all().with_types(["t1", "t2"]);
        assert!(filter.matches("n", "t1", "k"));
        assert!(filter.matches("n", "t2", "k"));
        assert!(!filter.matches("n", "t3", "k"));
    }

    #[test]
    fn prefix_replaces_key_set() {
        let filter = SearchFilter::all().with_keys(["other"]).with_key_prefix("k1");
        assert_eq!(filter.key_predicate(), KeyPredicate::Prefix("k1"));
        assert!(filter.matches("n", "t", "k1"));
        assert!(filter.matches("n", "t", "k1-suffix"));
        assert!(!filter.matches("n", "t", "other"));
    }

    #[test]
    fn key_set_without_prefix_applies() {
        let filter = SearchFilter::all().with_keys(["k1", "k2"]);
        assert!(filter.matches("n", "t", "k1"));
        assert!(!filter.matches("n", "t", "k3"));
    }

    #[test]
    fn load_criteria_defaults_to_values() {
        assert!(LoadCriteria::default().load_value);
        assert!(!LoadCriteria::metadata_only().load_value);
    }

    #[test]
    fn prefix_bounds_simple_ascii() {
        let (lo, hi) = prefix_bounds("abc");
        assert_eq!(lo, "abc");
        assert_eq!(hi.as_deref(), Some("abd"));
    }

    #[test]
    fn prefix_bounds_carries_past_max_scalar() {
        let (lo, hi) = prefix_bounds("a\u{10FFFF}");
        assert_eq!(lo, "a\u{10FFFF}");
        assert_eq!(hi.as_deref(), Some("b"));
    }

    #[test]
    fn prefix_bounds_skips_surrogate_gap() {
        let (_, hi) = prefix_bounds("\u{D7FF}");
        assert_eq!(hi.as_deref(), Some("\u{E000}"));
    }

    #[test]
    fn prefix_bounds_all_max_is_unbounded() {
        let (lo, hi) = prefix_bounds("\u{10FFFF}\u{10FFFF}");
        assert_eq!(lo, "\u{10FFFF}\u{10FFFF}");
        assert_eq!(hi, None);
    }

    #[test]
    fn empty_prefix_is_unbounded() {
        let (lo, hi) = prefix_bounds("");
        assert_eq!(lo, "");
        assert_eq!(hi, None);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// A key is inside the half-open range exactly when it starts
            /// with the prefix.
            #[test]
            fn bounds_are_equivalent_to_starts_with(
                prefix in "\\PC{0,6}",
                key in "\\PC{0,10}",
            ) {
                let (lo, hi) = prefix_bounds(&prefix);
                let in_range = key.as_str() >= lo.as_str()
                    && hi.as_deref().map_or(true, |hi| key.as_str() < hi);
                prop_assert_eq!(in_range, key.starts_with(&prefix));
            }

            /// Prefix-wins: with a prefix set, the key set never changes
            /// the outcome.
            #[test]
            fn prefix_wins_over_keys(
                prefix in "[a-c]{1,3}",
                keys in proptest::collection::btree_set("[a-c]{1,3}", 0..4),
                key in "[a-c]{1,4}",
            ) {
                let with_keys = SearchFilter {
                    keys,
                    key_prefix: Some(prefix.clone()),
                    ..SearchFilter::default()
                };
                let without_keys = SearchFilter {
                    key_prefix: Some(prefix),
                    ..SearchFilter::default()
                };
                prop_assert_eq!(
                    with_keys.matches("n", "t", &key),
                    without_keys.matches("n", "t", &key)
                );
            }
        }
    }
}
