//! In-memory transactional engine.
//!
//! This module provides [`MemoryBlobStoreFactory`], an in-process
//! implementation of the store contract suitable for tests, development,
//! and single-node deployments that do not need persistence.
//!
//! # Design
//!
//! One shared table `network_id -> TK -> Blob` is guarded by a single
//! [`parking_lot::RwLock`] shared by the factory and every transaction it
//! spawns. Each transaction additionally holds a private, unsynchronized
//! changeset `network_id -> TK -> Change`.
//!
//! - Reads take the shared read lock, snapshot the relevant rows, release
//!   the lock, then overlay the transaction's own pending changes
//!   (read-your-own-writes without re-acquiring the lock).
//! - Writes only mutate the local changeset; the shared table is untouched
//!   until commit.
//! - `commit` takes the write lock once and replays the changeset; it is
//!   the only code path allowed to acquire the write guard.
//! - `rollback` discards the changeset.
//!
//! Concurrent transactions may both read a stale row and both stage
//! conflicting writes; commits serialize on the write lock and the later
//! commit wins. There is no conflict detection beyond that serialization
//! point.
//!
//! # Example
//!
//! ```
//! use gridstore::{
//!     Blob, BlobStoreFactory, MemoryBlobStoreFactory, TransactionOptions, TypeAndKey,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let factory = MemoryBlobStoreFactory::new();
//!
//! let mut store = factory.start_transaction(TransactionOptions::default()).await.unwrap();
//! store.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await.unwrap();
//! store.commit().await.unwrap();
//! # });
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    error::{StorageError, StorageResult},
    filter::{LoadCriteria, SearchFilter},
    store::{BlobStore, BlobStoreFactory, TransactionOptions, TransactionState},
    types::{Blob, BlobWrite, TypeAndKey},
};

type TenantRows = HashMap<TypeAndKey, Blob>;
type Table = HashMap<String, TenantRows>;

/// In-memory implementation of [`BlobStoreFactory`].
///
/// # Cloning
///
/// The factory is cheaply cloneable via [`Arc`]; all clones (and every
/// transaction they spawn) share the same underlying table.
#[derive(Clone, Default)]
pub struct MemoryBlobStoreFactory {
    table: Arc<RwLock<Table>>,
}

impl MemoryBlobStoreFactory {
    /// Creates a factory with an empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryBlobStoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlobStoreFactory")
            .field("networks", &self.table.read().len())
            .finish()
    }
}

#[async_trait]
impl BlobStoreFactory for MemoryBlobStoreFactory {
    async fn start_transaction(
        &self,
        options: TransactionOptions,
    ) -> StorageResult<Box<dyn BlobStore>> {
        Ok(Box::new(MemoryBlobStore {
            shared: Arc::clone(&self.table),
            changes: HashMap::new(),
            options,
            state: TransactionState::Open,
        }))
    }
}

/// A pending operation staged by a transaction.
///
/// The two-variant enum makes a changeset entry with "neither create nor
/// delete" unrepresentable.
#[derive(Debug, Clone)]
enum Change {
    Upsert(Blob),
    Delete,
}

/// One open in-memory transaction.
struct MemoryBlobStore {
    shared: Arc<RwLock<Table>>,
    changes: HashMap<String, HashMap<TypeAndKey, Change>>,
    options: TransactionOptions,
    state: TransactionState,
}

impl MemoryBlobStore {
    fn ensure_writable(&self) -> StorageResult<()> {
        self.state.ensure_open()?;
        if self.options.read_only {
            return Err(StorageError::invalid_input("mutation in a read-only transaction"));
        }
        Ok(())
    }

    fn local_change(&self, network_id: &str, tk: &TypeAndKey) -> Option<&Change> {
        self.changes.get(network_id).and_then(|changes| changes.get(tk))
    }

    /// Version of the row as this transaction sees it: staged changes
    /// first, then the shared table.
    fn effective_version(&self, network_id: &str, tk: &TypeAndKey) -> Option<u64> {
        match self.local_change(network_id, tk) {
            Some(Change::Upsert(blob)) => Some(blob.version),
            Some(Change::Delete) => None,
            None => self
                .shared
                .read()
                .get(network_id)
                .and_then(|rows| rows.get(tk))
                .map(|blob| blob.version),
        }
    }

    /// Full row as this transaction sees it.
    fn effective_blob(&self, network_id: &str, tk: &TypeAndKey) -> Option<Blob> {
        match self.local_change(network_id, tk) {
            Some(Change::Upsert(blob)) => Some(blob.clone()),
            Some(Change::Delete) => None,
            None => self.shared.read().get(network_id).and_then(|rows| rows.get(tk)).cloned(),
        }
    }

    fn stage(&mut self, network_id: &str, tk: TypeAndKey, change: Change) {
        self.changes.entry(network_id.to_owned()).or_default().insert(tk, change);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_many(
        &mut self,
        network_id: &str,
        tks: &[TypeAndKey],
    ) -> StorageResult<Vec<Blob>> {
        self.state.ensure_open()?;

        // Snapshot under the read lock, overlay local changes after
        // releasing it.
        let snapshot: Vec<Option<Blob>> = {
            let table = self.shared.read();
            let rows = table.get(network_id);
            tks.iter().map(|tk| rows.and_then(|r| r.get(tk)).cloned()).collect()
        };

        let mut found = Vec::new();
        for (tk, stored) in tks.iter().zip(snapshot) {
            match self.local_change(network_id, tk) {
                Some(Change::Upsert(blob)) => found.push(blob.clone()),
                Some(Change::Delete) => {},
                None => {
                    if let Some(blob) = stored {
                        found.push(blob);
                    }
                },
            }
        }
        Ok(found)
    }

    async fn search(
        &mut self,
        filter: SearchFilter,
        criteria: LoadCriteria,
    ) -> StorageResult<HashMap<String, Vec<Blob>>> {
        self.state.ensure_open()?;

        let mut grouped: HashMap<String, TenantRows> = HashMap::new();
        {
            let table = self.shared.read();
            for (network_id, rows) in table.iter() {
                if !filter.matches_network(network_id) {
                    continue;
                }
                for (tk, blob) in rows {
                    if filter.matches(network_id, &tk.typ, &tk.key) {
                        grouped
                            .entry(network_id.clone())
                            .or_default()
                            .insert(tk.clone(), blob.clone());
                    }
                }
            }
        }

        // A staged upsert shares its TK's identity with any shadowed shared
        // row, so filter mismatch on one implies mismatch on the other.
        for (network_id, changes) in &self.changes {
            if !filter.matches_network(network_id) {
                continue;
            }
            for (tk, change) in changes {
                match change {
                    Change::Upsert(blob) => {
                        if filter.matches(network_id, &tk.typ, &tk.key) {
                            grouped
                                .entry(network_id.clone())
                                .or_default()
                                .insert(tk.clone(), blob.clone());
                        }
                    },
                    Change::Delete => {
                        if let Some(rows) = grouped.get_mut(network_id) {
                            rows.remove(tk);
                        }
                    },
                }
            }
        }

        let mut result = HashMap::new();
        for (network_id, rows) in grouped {
            if rows.is_empty() {
                continue;
            }
            let mut blobs: Vec<Blob> = rows
                .into_values()
                .map(|mut blob| {
                    if !criteria.load_value {
                        blob.value = None;
                    }
                    blob
                })
                .collect();
            blobs.sort_by(|a, b| (&a.typ, &a.key).cmp(&(&b.typ, &b.key)));
            result.insert(network_id, blobs);
        }
        Ok(result)
    }

    async fn write(&mut self, network_id: &str, blobs: Vec<BlobWrite>) -> StorageResult<()> {
        self.ensure_writable()?;

        for write in blobs {
            let tk = write.tk();
            let version = write.version.resolve(self.effective_version(network_id, &tk));
            let blob = Blob { typ: write.typ, key: write.key, value: write.value, version };
            self.stage(network_id, tk, Change::Upsert(blob));
        }
        Ok(())
    }

    async fn increment_version(
        &mut self,
        network_id: &str,
        tk: &TypeAndKey,
    ) -> StorageResult<()> {
        self.ensure_writable()?;

        let next = match self.effective_blob(network_id, tk) {
            // Carry the existing value forward unchanged.
            Some(blob) => {
                let version = blob.version + 1;
                Blob { version, ..blob }
            },
            None => Blob { typ: tk.typ.clone(), key: tk.key.clone(), value: None, version: 1 },
        };
        self.stage(network_id, tk.clone(), Change::Upsert(next));
        Ok(())
    }

    async fn get_existing_keys(
        &mut self,
        keys: &[String],
        filter: SearchFilter,
    ) -> StorageResult<Vec<String>> {
        self.state.ensure_open()?;

        let requested: BTreeSet<&str> = keys.iter().map(String::as_str).collect();
        let mut found = BTreeSet::new();

        {
            let table = self.shared.read();
            for (network_id, rows) in table.iter() {
                if !filter.matches_network(network_id) {
                    continue;
                }
                for tk in rows.keys() {
                    if requested.contains(tk.key.as_str())
                        && !matches!(self.local_change(network_id, tk), Some(Change::Delete))
                    {
                        found.insert(tk.key.clone());
                    }
                }
            }
        }

        for (network_id, changes) in &self.changes {
            if !filter.matches_network(network_id) {
                continue;
            }
            for (tk, change) in changes {
                if matches!(change, Change::Upsert(_)) && requested.contains(tk.key.as_str()) {
                    found.insert(tk.key.clone());
                }
            }
        }

        Ok(found.into_iter().collect())
    }

    async fn delete(&mut self, network_id: &str, tks: &[TypeAndKey]) -> StorageResult<()> {
        self.ensure_writable()?;

        for tk in tks {
            self.stage(network_id, tk.clone(), Change::Delete);
        }
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.state.ensure_open()?;

        let changes = std::mem::take(&mut self.changes);
        let staged: usize = changes.values().map(HashMap::len).sum();
        {
            let mut table = self.shared.write();
            for (network_id, tenant_changes) in changes {
                let rows = table.entry(network_id).or_default();
                for (tk, change) in tenant_changes {
                    match change {
                        Change::Upsert(blob) => {
                            rows.insert(tk, blob);
                        },
                        Change::Delete => {
                            rows.remove(&tk);
                        },
                    }
                }
            }
        }
        self.state = TransactionState::Committed;
        tracing::debug!(staged, "committed in-memory transaction");
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.state.ensure_open()?;

        self.changes.clear();
        self.state = TransactionState::RolledBack;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn begin(factory: &MemoryBlobStoreFactory) -> Box<dyn BlobStore> {
        factory.start_transaction(TransactionOptions::default()).await.unwrap()
    }

    #[tokio::test]
    async fn write_then_get_round_trips() {
        let factory = MemoryBlobStoreFactory::new();
        let mut store = begin(&factory).await;

        store.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await.unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        let blob = store.get("n1", &TypeAndKey::new("t1", "k1")).await.unwrap();
        assert_eq!(blob.value.as_deref(), Some(b"v1".as_slice()));
        assert_eq!(blob.version, 0);
    }

    #[tokio::test]
    async fn reads_observe_own_uncommitted_writes() {
        let factory = MemoryBlobStoreFactory::new();
        let mut store = begin(&factory).await;

        store.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await.unwrap();

        let blob = store.get("n1", &TypeAndKey::new("t1", "k1")).await.unwrap();
        assert_eq!(blob.value.as_deref(), Some(b"v1".as_slice()));

        store.delete("n1", &[TypeAndKey::new("t1", "k1")]).await.unwrap();
        let result = store.get("n1", &TypeAndKey::new("t1", "k1")).await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn uncommitted_writes_invisible_to_other_transactions() {
        let factory = MemoryBlobStoreFactory::new();
        let mut writer = begin(&factory).await;
        writer.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await.unwrap();

        let mut reader = begin(&factory).await;
        let result = reader.get("n1", &TypeAndKey::new("t1", "k1")).await;
        assert!(result.unwrap_err().is_not_found());

        writer.commit().await.unwrap();

        let blob = reader.get("n1", &TypeAndKey::new("t1", "k1")).await.unwrap();
        assert_eq!(blob.value.as_deref(), Some(b"v1".as_slice()));
    }

    #[tokio::test]
    async fn rollback_restores_pre_transaction_state() {
        let factory = MemoryBlobStoreFactory::new();
        let mut store = begin(&factory).await;
        store.create_or_update("n1", vec![Blob::new("t1", "k1", "original")]).await.unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        store.create_or_update("n1", vec![Blob::new("t1", "k1", "changed")]).await.unwrap();
        store.delete("n1", &[TypeAndKey::new("t1", "k1")]).await.unwrap();
        store.rollback().await.unwrap();

        let mut store = begin(&factory).await;
        let blob = store.get("n1", &TypeAndKey::new("t1", "k1")).await.unwrap();
        assert_eq!(blob.value.as_deref(), Some(b"original".as_slice()));
    }

    #[tokio::test]
    async fn overlapping_commits_last_writer_wins() {
        let factory = MemoryBlobStoreFactory::new();

        let mut first = begin(&factory).await;
        let mut second = begin(&factory).await;
        first.create_or_update("n1", vec![Blob::new("t1", "k1", "first")]).await.unwrap();
        second.create_or_update("n1", vec![Blob::new("t1", "k1", "second")]).await.unwrap();

        first.commit().await.unwrap();
        second.commit().await.unwrap();

        let mut store = begin(&factory).await;
        let blob = store.get("n1", &TypeAndKey::new("t1", "k1")).await.unwrap();
        assert_eq!(blob.value.as_deref(), Some(b"second".as_slice()));
    }

    #[tokio::test]
    async fn version_protocol_on_updates() {
        let factory = MemoryBlobStoreFactory::new();
        let tk = TypeAndKey::new("t1", "k1");

        let mut store = begin(&factory).await;
        store.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await.unwrap();
        // Auto bump happens against the staged row, not just the shared
        // table: staged version 0, update resolves to 1.
        store.create_or_update("n1", vec![Blob::new("t1", "k1", "v2")]).await.unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        let blob = store.get("n1", &tk).await.unwrap();
        assert_eq!(blob.version, 1);
        assert_eq!(blob.value.as_deref(), Some(b"v2".as_slice()));

        store.create_or_update("n1", vec![Blob::new("t1", "k1", "v3").with_version(100)]).await.unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        assert_eq!(store.get("n1", &tk).await.unwrap().version, 100);
    }

    #[tokio::test]
    async fn increment_version_preserves_value() {
        let factory = MemoryBlobStoreFactory::new();
        let tk = TypeAndKey::new("t1", "k1");

        let mut store = begin(&factory).await;
        store.increment_version("n1", &tk).await.unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        let blob = store.get("n1", &tk).await.unwrap();
        assert_eq!(blob.version, 1);
        assert_eq!(blob.value, None);

        store.create_or_update("n1", vec![Blob::new("t1", "k1", "payload").with_version(5)]).await.unwrap();
        store.increment_version("n1", &tk).await.unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        let blob = store.get("n1", &tk).await.unwrap();
        assert_eq!(blob.version, 6);
        assert_eq!(blob.value.as_deref(), Some(b"payload".as_slice()));
    }

    #[tokio::test]
    async fn search_overlays_local_changes() {
        let factory = MemoryBlobStoreFactory::new();
        let mut store = begin(&factory).await;
        store
            .create_or_update(
                "n1",
                vec![Blob::new("t1", "k1", "committed"), Blob::new("t1", "k2", "doomed")],
            )
            .await
            .unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        store.create_or_update("n1", vec![Blob::new("t1", "k3", "staged")]).await.unwrap();
        store.delete("n1", &[TypeAndKey::new("t1", "k2")]).await.unwrap();

        let results = store
            .search(SearchFilter::within("n1"), LoadCriteria::default())
            .await
            .unwrap();
        let keys: Vec<&str> = results["n1"].iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k3"]);
    }

    #[tokio::test]
    async fn get_existing_keys_sees_local_changes() {
        let factory = MemoryBlobStoreFactory::new();
        let mut store = begin(&factory).await;
        store.create_or_update("n1", vec![Blob::new("t1", "k1", "v")]).await.unwrap();
        store.commit().await.unwrap();

        let mut store = begin(&factory).await;
        store.create_or_update("n2", vec![Blob::new("t1", "k2", "v")]).await.unwrap();
        store.delete("n1", &[TypeAndKey::new("t1", "k1")]).await.unwrap();

        let keys = store
            .get_existing_keys(
                &["k1".to_owned(), "k2".to_owned(), "k9".to_owned()],
                SearchFilter::all(),
            )
            .await
            .unwrap();
        assert_eq!(keys, vec!["k2".to_owned()]);
    }

    #[tokio::test]
    async fn read_only_transaction_rejects_mutations() {
        let factory = MemoryBlobStoreFactory::new();
        let mut store =
            factory.start_transaction(TransactionOptions::read_only()).await.unwrap();

        let result = store.create_or_update("n1", vec![Blob::new("t1", "k1", "v")]).await;
        assert!(matches!(result, Err(StorageError::InvalidInput { .. })));

        let result = store.increment_version("n1", &TypeAndKey::new("t1", "k1")).await;
        assert!(matches!(result, Err(StorageError::InvalidInput { .. })));

        // Reads still work.
        assert!(store.get_many("n1", &[]).await.is_ok());
        store.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn terminated_transaction_rejects_everything() {
        let factory = MemoryBlobStoreFactory::new();
        let mut store = begin(&factory).await;
        store.commit().await.unwrap();

        assert!(store.commit().await.unwrap_err().is_no_transaction());
        assert!(store.rollback().await.unwrap_err().is_no_transaction());
        assert!(store.get_many("n1", &[]).await.unwrap_err().is_no_transaction());
        assert!(store
            .search(SearchFilter::all(), LoadCriteria::default())
            .await
            .unwrap_err()
            .is_no_transaction());
    }
}
