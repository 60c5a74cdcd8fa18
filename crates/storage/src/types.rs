//! Core data model for stored records.
//!
//! This module defines the unit of storage ([`Blob`]), its composite
//! identity within a tenant ([`TypeAndKey`]), and the tagged write request
//! ([`BlobWrite`] / [`WriteVersion`]) that drives the optimistic versioning
//! protocol.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Composite identity of a blob within one tenant: `(type, key)`.
///
/// The `type` names a record kind or category (e.g. a service's record-type
/// constant); the `key` is unique within that type. Together with the
/// tenant's network id, a TK fully identifies one stored row.
///
/// # Examples
///
/// ```
/// use gridstore::TypeAndKey;
///
/// let tk = TypeAndKey::new("gateway_cert", "gw42");
/// assert_eq!(tk.to_string(), "gateway_cert/gw42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeAndKey {
    /// Record kind/category.
    #[serde(rename = "type")]
    pub typ: String,

    /// Unique key within `typ`.
    pub key: String,
}

impl TypeAndKey {
    /// Creates a TK from a type and a key.
    pub fn new(typ: impl Into<String>, key: impl Into<String>) -> Self {
        Self { typ: typ.into(), key: key.into() }
    }
}

impl std::fmt::Display for TypeAndKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.typ, self.key)
    }
}

/// The stored unit: an opaque byte payload with identity and a version
/// counter.
///
/// `value` is never interpreted by the storage engine; `None` models a row
/// whose payload column is absent (e.g. a row created purely by
/// [`increment_version`](crate::BlobStore::increment_version)).
///
/// The `version` field is an optimistic-concurrency counter. How it
/// advances on writes is governed by [`WriteVersion`]; see the write
/// protocol documented on [`BlobStore::write`](crate::BlobStore::write).
///
/// # Examples
///
/// ```
/// use gridstore::Blob;
///
/// let blob = Blob::new("probe_state", "probe-7", "serialized-state");
/// assert_eq!(blob.version, 0);
/// assert!(blob.value.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Record kind/category.
    #[serde(rename = "type")]
    pub typ: String,

    /// Unique key within `typ`.
    pub key: String,

    /// Opaque payload; `None` when the row has no value.
    pub value: Option<Bytes>,

    /// Optimistic-concurrency counter.
    pub version: u64,
}

impl Blob {
    /// Creates a blob at version 0 with the given payload.
    pub fn new(typ: impl Into<String>, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self { typ: typ.into(), key: key.into(), value: Some(value.into()), version: 0 }
    }

    /// Returns the same blob with `version` replaced.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// The blob's identity within its tenant.
    pub fn tk(&self) -> TypeAndKey {
        TypeAndKey::new(self.typ.clone(), self.key.clone())
    }
}

/// How the stored version is computed when a write lands.
///
/// The legacy wire form overloads the number zero: a caller passing
/// `version == 0` means "let the store pick", which makes it impossible to
/// deliberately persist version 0 on an update. The tagged form keeps that
/// behavior available through [`WriteVersion::from_numeric`] while also
/// admitting `Exact(0)` for callers that really mean it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteVersion {
    /// Store picks: `existing + 1` on update, `0` on first insert.
    Auto,

    /// Caller-supplied value, written verbatim. Overrides the counter on
    /// updates (e.g. to replay an externally tracked sequence number).
    Exact(u64),
}

impl WriteVersion {
    /// Legacy numeric mapping: `0` means [`Auto`](WriteVersion::Auto),
    /// anything else is [`Exact`](WriteVersion::Exact).
    pub fn from_numeric(version: u64) -> Self {
        if version == 0 {
            Self::Auto
        } else {
            Self::Exact(version)
        }
    }

    /// Resolves the version to store given the version of the existing row,
    /// if any. This is the single place the optimistic versioning
    /// arithmetic lives; every backend calls it.
    pub fn resolve(self, existing: Option<u64>) -> u64 {
        match (self, existing) {
            (Self::Exact(v), _) => v,
            (Self::Auto, Some(current)) => current + 1,
            (Self::Auto, None) => 0,
        }
    }
}

/// One upsert request: a payload plus a [`WriteVersion`].
///
/// Build one directly for the tagged API, or convert from a [`Blob`] to get
/// the legacy numeric-zero mapping:
///
/// ```
/// use gridstore::{Blob, BlobWrite, WriteVersion};
///
/// let legacy = BlobWrite::from(Blob::new("t", "k", "v"));
/// assert_eq!(legacy.version, WriteVersion::Auto);
///
/// let seeded = BlobWrite::from(Blob::new("t", "k", "v").with_version(100));
/// assert_eq!(seeded.version, WriteVersion::Exact(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobWrite {
    /// Record kind/category.
    #[serde(rename = "type")]
    pub typ: String,

    /// Unique key within `typ`.
    pub key: String,

    /// Opaque payload to store; `None` clears the value column.
    pub value: Option<Bytes>,

    /// How the stored version is computed.
    pub version: WriteVersion,
}

impl BlobWrite {
    /// Creates an auto-versioned write.
    pub fn new(typ: impl Into<String>, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            typ: typ.into(),
            key: key.into(),
            value: Some(value.into()),
            version: WriteVersion::Auto,
        }
    }

    /// Returns the same write with an exact version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = WriteVersion::Exact(version);
        self
    }

    /// The write's target identity.
    pub fn tk(&self) -> TypeAndKey {
        TypeAndKey::new(self.typ.clone(), self.key.clone())
    }
}

impl From<Blob> for BlobWrite {
    fn from(blob: Blob) -> Self {
        Self {
            typ: blob.typ,
            key: blob.key,
            value: blob.value,
            version: WriteVersion::from_numeric(blob.version),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tk_display_joins_type_and_key() {
        let tk = TypeAndKey::new("t1", "k1");
        assert_eq!(tk.to_string(), "t1/k1");
    }

    #[test]
    fn resolve_auto_on_insert_is_zero() {
        assert_eq!(WriteVersion::Auto.resolve(None), 0);
    }

    #[test]
    fn resolve_auto_on_update_increments() {
        assert_eq!(WriteVersion::Auto.resolve(Some(0)), 1);
        assert_eq!(WriteVersion::Auto.resolve(Some(41)), 42);
    }

    #[test]
    fn resolve_exact_overrides_counter() {
        assert_eq!(WriteVersion::Exact(100).resolve(Some(3)), 100);
        assert_eq!(WriteVersion::Exact(7).resolve(None), 7);
        // The tagged form can persist version 0 on an update, which the
        // numeric overload cannot express.
        assert_eq!(WriteVersion::Exact(0).resolve(Some(9)), 0);
    }

    #[test]
    fn from_numeric_treats_zero_as_auto() {
        assert_eq!(WriteVersion::from_numeric(0), WriteVersion::Auto);
        assert_eq!(WriteVersion::from_numeric(5), WriteVersion::Exact(5));
    }

    #[test]
    fn blob_write_from_blob_keeps_payload() {
        let write = BlobWrite::from(Blob::new("t", "k", "payload"));
        assert_eq!(write.value.as_deref(), Some(b"payload".as_slice()));
        assert_eq!(write.tk(), TypeAndKey::new("t", "k"));
    }
}
