//! Shared test utilities for backend testing.
//!
//! This module provides common helpers for generating test blobs and
//! asserting on [`StorageResult`] values. It is feature-gated behind
//! `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In backend crates, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! gridstore = { workspace = true, features = ["testutil"] }
//! ```

use crate::{
    error::{StorageError, StorageResult},
    types::{Blob, TypeAndKey},
};

/// Creates a deterministic test blob: `"{typ}"/"{key}:{idx:04}"` with a
/// value naming its origin and version 0.
///
/// The zero-padding keeps lexicographic key ordering aligned with numeric
/// ordering, which matters for sorted-scan assertions.
#[must_use]
pub fn make_blob(typ: &str, key_prefix: &str, idx: usize) -> Blob {
    Blob::new(typ, format!("{key_prefix}:{idx:04}"), format!("value-{typ}-{idx}"))
}

/// Creates a deterministic TK matching [`make_blob`].
#[must_use]
pub fn make_tk(typ: &str, key_prefix: &str, idx: usize) -> TypeAndKey {
    TypeAndKey::new(typ, format!("{key_prefix}:{idx:04}"))
}

/// Assert that a [`StorageResult`] is a [`StorageError::NotFound`].
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "expected StorageError::NotFound, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NotFound { .. })),
            "{}: expected StorageError::NotFound, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Assert that a [`StorageResult`] is a [`StorageError::NoTransaction`].
#[macro_export]
macro_rules! assert_no_transaction {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NoTransaction)),
            "expected StorageError::NoTransaction, got: {:?}",
            $result,
        );
    };
    ($result:expr, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::NoTransaction)),
            "{}: expected StorageError::NoTransaction, got: {:?}",
            $msg,
            $result,
        );
    };
}

/// Helper to verify that a result is the `NotFound` sentinel.
pub fn is_not_found<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::NotFound { .. }))
}

/// Helper to verify that a result is the terminated-transaction error.
pub fn is_no_transaction<T>(result: &StorageResult<T>) -> bool {
    matches!(result, Err(StorageError::NoTransaction))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_make_blob_format() {
        let blob = make_blob("t1", "k", 42);
        assert_eq!(blob.key, "k:0042");
        assert_eq!(blob.version, 0);
        assert_eq!(blob.tk(), make_tk("t1", "k", 42));
    }

    #[test]
    fn test_make_tk_ordering() {
        assert!(make_tk("t", "k", 1) < make_tk("t", "k", 10));
        assert!(make_tk("t", "k", 10) < make_tk("t", "k", 100));
    }

    #[test]
    fn test_assert_not_found_macro() {
        let result: StorageResult<()> = Err(StorageError::not_found("t", "k"));
        assert_not_found!(result);
        assert!(is_not_found(&result));
    }

    #[test]
    fn test_assert_no_transaction_macro() {
        let result: StorageResult<()> = Err(StorageError::NoTransaction);
        assert_no_transaction!(result);
        assert!(is_no_transaction(&result));
    }
}
