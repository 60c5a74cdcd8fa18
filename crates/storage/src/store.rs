//! The store contract every backend implements.
//!
//! A [`BlobStoreFactory`] opens transactions; each [`BlobStore`] handle is
//! one open transaction and is terminated by exactly one of
//! [`commit`](BlobStore::commit) or [`rollback`](BlobStore::rollback).
//!
//! # Transaction Semantics
//!
//! - **Atomicity**: no partial write is visible to other transactions before `commit` returns
//! - **Read-your-writes**: reads within a transaction observe its own uncommitted writes
//! - **Terminal state**: any operation after termination fails with
//!   [`StorageError::NoTransaction`], never a panic
//!
//! Cross-transaction isolation is whatever the backend provides: the
//! in-memory engine serializes commits only (last writer wins), the
//! relational engines inherit the database's isolation level.
//!
//! # Example
//!
//! ```
//! use gridstore::{Blob, BlobStoreFactory, MemoryBlobStoreFactory, TransactionOptions, TypeAndKey};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let factory = MemoryBlobStoreFactory::new();
//!
//! let mut store = factory.start_transaction(TransactionOptions::default()).await.unwrap();
//! store.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await.unwrap();
//! store.commit().await.unwrap();
//!
//! let mut store = factory.start_transaction(TransactionOptions::default()).await.unwrap();
//! let blob = store.get("n1", &TypeAndKey::new("t1", "k1")).await.unwrap();
//! assert_eq!(blob.value.as_deref(), Some(b"v1".as_slice()));
//! store.rollback().await.unwrap();
//! # });
//! ```

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    error::{StorageError, StorageResult},
    filter::{LoadCriteria, SearchFilter},
    types::{Blob, BlobWrite, TypeAndKey},
};

/// Network id used by callers whose domain is not actually multi-tenant.
///
/// The engine does not special-case this value; it is a caller convention.
pub const PLACEHOLDER_NETWORK_ID: &str = "placeholder_network";

/// Isolation hint for the underlying backend transaction.
///
/// The in-memory engine ignores it. The relational engine maps
/// `ReadCommitted` (and `None`) to a deferred transaction and
/// `Serializable` to one that takes the write lock up front, surfacing
/// write-write conflicts early as [`StorageError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Isolation {
    /// Database default isolation.
    ReadCommitted,
    /// Serializable isolation; conflicts surface as retryable errors.
    Serializable,
}

/// Options for [`BlobStoreFactory::start_transaction`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Reject mutations on this handle; backends may additionally enforce
    /// read-only mode at the connection level.
    pub read_only: bool,

    /// Optional isolation hint; `None` means backend default.
    pub isolation: Option<Isolation>,
}

impl TransactionOptions {
    /// Options for a read-only transaction.
    pub fn read_only() -> Self {
        Self { read_only: true, isolation: None }
    }

    /// Returns the same options with an isolation hint.
    #[must_use]
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = Some(isolation);
        self
    }
}

/// Lifecycle state of a transaction handle.
///
/// Checked at the top of every operation; misuse is a typed error, never a
/// crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Operations are accepted.
    Open,
    /// Terminated by a (possibly failed) commit.
    Committed,
    /// Terminated by rollback.
    RolledBack,
}

impl TransactionState {
    /// Returns [`StorageError::NoTransaction`] unless the transaction is
    /// still open.
    pub fn ensure_open(self) -> StorageResult<()> {
        match self {
            Self::Open => Ok(()),
            Self::Committed | Self::RolledBack => Err(StorageError::NoTransaction),
        }
    }

    /// Whether a terminal operation already ran.
    #[must_use]
    pub fn is_terminated(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Creates [`BlobStore`] handles, each bound to a new backend transaction.
#[async_trait]
pub trait BlobStoreFactory: Send + Sync {
    /// Begins a new transaction.
    ///
    /// The returned handle owns the underlying resources (for a relational
    /// backend, one checked-out database transaction) until terminated;
    /// abandoning a handle without `rollback` holds them until drop.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn start_transaction(
        &self,
        options: TransactionOptions,
    ) -> StorageResult<Box<dyn BlobStore>>;
}

/// A transaction-scoped storage handle.
///
/// All operations are scoped to one tenant per call, except
/// [`search`](BlobStore::search) and
/// [`get_existing_keys`](BlobStore::get_existing_keys), which may span
/// tenants.
#[async_trait]
pub trait BlobStore: Send {
    /// Best-effort batch lookup: TKs with no matching row are simply absent
    /// from the result, in input order, with no per-key error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_many(
        &mut self,
        network_id: &str,
        tks: &[TypeAndKey],
    ) -> StorageResult<Vec<Blob>>;

    /// Predicate-based scan across one or all tenants, grouped by tenant.
    ///
    /// Tenants with no matching blobs are absent from the map. Result
    /// vectors are ordered by `(type, key)`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn search(
        &mut self,
        filter: SearchFilter,
        criteria: LoadCriteria,
    ) -> StorageResult<HashMap<String, Vec<Blob>>>;

    /// Upserts the given blobs into one tenant.
    ///
    /// Per blob: if no row exists for its TK, the row is inserted with the
    /// resolved version ([`WriteVersion::resolve`](crate::WriteVersion::resolve)
    /// with no existing row — `Auto` stores 0, `Exact(v)` stores `v`
    /// verbatim). If a row exists, `Auto` stores `existing + 1` and
    /// `Exact(v)` overrides the counter with `v`.
    ///
    /// A failure during the internal read-then-partition step aborts the
    /// whole call; no partial writes are issued.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn write(&mut self, network_id: &str, blobs: Vec<BlobWrite>) -> StorageResult<()>;

    /// Atomic upsert: inserts a fresh row at version 1, or bumps the
    /// existing row's version by 1, carrying its value forward unchanged.
    ///
    /// Callers use this as a monotonic sequence number without knowing the
    /// prior value.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn increment_version(
        &mut self,
        network_id: &str,
        tk: &TypeAndKey,
    ) -> StorageResult<()>;

    /// Returns the subset of `keys` that exist anywhere (or, when
    /// `filter.network_id` is set, within that tenant), deduplicated and
    /// sorted. Only the filter's network predicate is consulted.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_existing_keys(
        &mut self,
        keys: &[String],
        filter: SearchFilter,
    ) -> StorageResult<Vec<String>>;

    /// Removes rows. Deleting a non-existent TK is not an error.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&mut self, network_id: &str, tks: &[TypeAndKey]) -> StorageResult<()>;

    /// Atomically publishes every write of this transaction and terminates
    /// the handle. A failed commit still terminates it; the same handle is
    /// never retried.
    #[must_use = "commit results signal whether writes were published and must be inspected"]
    async fn commit(&mut self) -> StorageResult<()>;

    /// Discards every write of this transaction and terminates the handle.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn rollback(&mut self) -> StorageResult<()>;

    /// Single-key lookup; delegates to [`get_many`](BlobStore::get_many)
    /// and returns the [`StorageError::NotFound`] sentinel when absent.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&mut self, network_id: &str, tk: &TypeAndKey) -> StorageResult<Blob> {
        let blobs = self.get_many(network_id, std::slice::from_ref(tk)).await?;
        blobs
            .into_iter()
            .find(|b| b.typ == tk.typ && b.key == tk.key)
            .ok_or_else(|| StorageError::not_found(&tk.typ, &tk.key))
    }

    /// Upserts blobs using the legacy numeric version mapping
    /// (`version == 0` means auto); delegates to
    /// [`write`](BlobStore::write).
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn create_or_update(&mut self, network_id: &str, blobs: Vec<Blob>) -> StorageResult<()> {
        let writes = blobs.into_iter().map(BlobWrite::from).collect();
        self.write(network_id, writes).await
    }

    /// Lists the keys of one tenant and record type, sorted, without
    /// fetching values.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn list_keys(&mut self, network_id: &str, typ: &str) -> StorageResult<Vec<String>> {
        let filter = SearchFilter::within(network_id).with_types([typ]);
        let mut found = self.search(filter, LoadCriteria::metadata_only()).await?;
        let mut keys: Vec<String> = found
            .remove(network_id)
            .unwrap_or_default()
            .into_iter()
            .map(|blob| blob.key)
            .collect();
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_open_accepts_only_open() {
        assert!(TransactionState::Open.ensure_open().is_ok());
        assert!(TransactionState::Committed.ensure_open().unwrap_err().is_no_transaction());
        assert!(TransactionState::RolledBack.ensure_open().unwrap_err().is_no_transaction());
    }

    #[test]
    fn terminated_states() {
        assert!(!TransactionState::Open.is_terminated());
        assert!(TransactionState::Committed.is_terminated());
        assert!(TransactionState::RolledBack.is_terminated());
    }

    #[test]
    fn read_only_options() {
        let opts = TransactionOptions::read_only().with_isolation(Isolation::Serializable);
        assert!(opts.read_only);
        assert_eq!(opts.isolation, Some(Isolation::Serializable));
    }
}
