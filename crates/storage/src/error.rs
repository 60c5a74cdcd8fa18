//! Storage error types and result alias.
//!
//! This module defines the error types that can occur during storage
//! operations. All backends map their internal errors to these standardized
//! types so callers can branch on classification rather than backend
//! details.
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - A single-key read found no row
//! - [`StorageError::NoTransaction`] - Operation on a terminated transaction
//! - [`StorageError::Conflict`] - Retryable concurrency conflict (e.g. a serialization failure)
//! - [`StorageError::Backend`] - Connection/query failure, wrapped with operation context
//! - [`StorageError::InvalidInput`] - Caller misuse (e.g. writing in a read-only transaction)
//!
//! # Example
//!
//! ```
//! use gridstore::{StorageError, StorageResult};
//!
//! fn lookup(typ: &str, key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(typ, key))
//! }
//!
//! assert!(lookup("t1", "k1").unwrap_err().is_not_found());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute, and
/// backend failures carry enough context (operation, tenant, TK) to
/// diagnose without any logging inside the engine.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` — new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A requested single-key read found no row.
    ///
    /// This is a recoverable sentinel; several consumers branch on it for
    /// "create on first use" logic.
    #[error("blob {typ}/{key} not found")]
    NotFound {
        /// Record type of the missing blob.
        typ: String,
        /// Key of the missing blob.
        key: String,
    },

    /// The transaction was never started, or was already committed or
    /// rolled back.
    #[error("no transaction available")]
    NoTransaction,

    /// A concurrency conflict the caller is expected to retry at a higher
    /// layer (the engine never retries internally).
    #[error("transaction conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// Connection or query failure from the underlying backend.
    #[error("{context}")]
    Backend {
        /// Operation name plus tenant/TK context.
        context: String,
        /// The underlying backend error.
        #[source]
        source: Option<BoxError>,
    },

    /// Caller misuse, e.g. a mutation in a read-only transaction or an
    /// invalid table identifier.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the misuse.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error for the given TK.
    #[must_use]
    pub fn not_found(typ: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound { typ: typ.into(), key: key.into() }
    }

    /// Creates a new `Conflict` error with the given message.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    /// Creates a new `Backend` error with the given context.
    #[must_use]
    pub fn backend(context: impl Into<String>) -> Self {
        Self::Backend { context: context.into(), source: None }
    }

    /// Creates a new `Backend` error with context and a source error.
    #[must_use]
    pub fn backend_with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend { context: context.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `InvalidInput` error with the given message.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Whether this is the `NotFound` sentinel.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is the terminated-transaction error.
    #[must_use]
    pub fn is_no_transaction(&self) -> bool {
        matches!(self, Self::NoTransaction)
    }

    /// Whether this is a retryable concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
