//! Parity implementation of the gridstore contract through an ORM.
//!
//! This crate provides [`OrmBlobStoreFactory`], a second relational engine
//! built on diesel instead of hand-built SQL. It exists to prove backend
//! interchangeability: it targets the **same physical table** as
//! `gridstore-sql` (identical columns, types, and primary key), so data
//! written through either engine reads back byte-for-byte through the
//! other, with no migration step. The parity tests in `tests/parity.rs`
//! hold both engines to that.
//!
//! # Differences from the hand-built engine
//!
//! - Transactions are driven through diesel's `AnsiTransactionManager`,
//!   which always issues a plain `BEGIN`; the
//!   [`Isolation`](gridstore::Isolation) hint is accepted but advisory
//!   here (SQLite transactions are serializable regardless).
//! - Everything else (version arithmetic, search predicates, the
//!   increment upsert leaving the value column untouched) matches the
//!   contract exactly, which the shared conformance suite verifies.
//!
//! # Example
//!
//! ```no_run
//! use gridstore::{Blob, BlobStoreFactory, TransactionOptions};
//! use gridstore_orm::OrmBlobStoreFactory;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = OrmBlobStoreFactory::open("blobs.db").await?;
//!
//!     let mut store = factory.start_transaction(TransactionOptions::default()).await?;
//!     store.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await?;
//!     store.commit().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use diesel::connection::{AnsiTransactionManager, SimpleConnection, TransactionManager};
use diesel::prelude::*;
use diesel::sql_types::Bool;
use diesel::sqlite::{Sqlite, SqliteConnection};
use gridstore::{
    Blob, BlobStore, BlobStoreFactory, BlobWrite, KeyPredicate, LoadCriteria, SearchFilter,
    StorageError, StorageResult, TransactionOptions, TransactionState, TypeAndKey, prefix_bounds,
};
use parking_lot::Mutex;

pub mod schema;

use schema::network_blobs;

/// One stored row, shaped exactly like the shared table.
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = network_blobs)]
struct BlobRow {
    network_id: String,
    record_type: String,
    key: String,
    value: Option<Vec<u8>>,
    version: i64,
}

impl BlobRow {
    fn into_blob(self, load_value: bool) -> (String, Blob) {
        let value = if load_value { self.value.map(Bytes::from) } else { None };
        (
            self.network_id,
            Blob { typ: self.record_type, key: self.key, value, version: self.version as u64 },
        )
    }
}

/// Boxed predicate over the blob table, used to assemble dynamic
/// disjunctions.
type DynPredicate = Box<dyn BoxableExpression<network_blobs::table, Sqlite, SqlType = Bool>>;

/// ORM-backed implementation of [`BlobStoreFactory`].
///
/// Opening the factory creates the shared blob table idempotently (the
/// same DDL the hand-built engine runs), wrapped in its own transaction.
#[derive(Clone)]
pub struct OrmBlobStoreFactory {
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for OrmBlobStoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrmBlobStoreFactory").field("path", &self.path).finish()
    }
}

impl OrmBlobStoreFactory {
    /// Opens (or creates) the database and ensures the shared blob table
    /// exists.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = Arc::new(path.into());

        let init_path = Arc::clone(&path);
        run_blocking("init_schema", move || {
            let mut conn = establish(&init_path, false)?;
            conn.transaction(|conn| {
                conn.batch_execute(
                    "CREATE TABLE IF NOT EXISTS network_blobs (
                        network_id TEXT NOT NULL,
                        type       TEXT NOT NULL,
                        \"key\"    TEXT NOT NULL,
                        value      BLOB,
                        version    BIGINT NOT NULL DEFAULT 0,
                        PRIMARY KEY (network_id, type, \"key\")
                    );",
                )
            })
            .map_err(|e| map_diesel_err("init_schema", e))
        })
        .await?;
        tracing::debug!(path = %path.display(), "opened orm blob store");

        Ok(Self { path })
    }
}

#[async_trait]
impl BlobStoreFactory for OrmBlobStoreFactory {
    async fn start_transaction(
        &self,
        options: TransactionOptions,
    ) -> StorageResult<Box<dyn BlobStore>> {
        let path = Arc::clone(&self.path);
        let conn = run_blocking("start_transaction", move || {
            let mut conn = establish(&path, options.read_only)?;
            AnsiTransactionManager::begin_transaction(&mut conn)
                .map_err(|e| map_diesel_err("start_transaction", e))?;
            Ok(conn)
        })
        .await?;

        tracing::debug!(read_only = options.read_only, "started orm transaction");
        Ok(Box::new(OrmBlobStore {
            conn: Arc::new(Mutex::new(conn)),
            options,
            state: TransactionState::Open,
        }))
    }
}

/// One open ORM-managed transaction.
struct OrmBlobStore {
    conn: Arc<Mutex<SqliteConnection>>,
    options: TransactionOptions,
    state: TransactionState,
}

impl OrmBlobStore {
    fn ensure_writable(&self) -> StorageResult<()> {
        self.state.ensure_open()?;
        if self.options.read_only {
            return Err(StorageError::invalid_input("mutation in a read-only transaction"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for OrmBlobStore {
    async fn get_many(
        &mut self,
        network_id: &str,
        tks: &[TypeAndKey],
    ) -> StorageResult<Vec<Blob>> {
        self.state.ensure_open()?;
        if tks.is_empty() {
            return Ok(Vec::new());
        }

        let conn = Arc::clone(&self.conn);
        let network = network_id.to_owned();
        let tks = tks.to_vec();
        run_blocking("get_many", move || {
            use schema::network_blobs::dsl;

            let mut conn = conn.lock();
            let rows: Vec<BlobRow> = network_blobs::table
                .filter(dsl::network_id.eq(&network))
                .filter(tk_disjunction(&tks))
                .load(&mut *conn)
                .map_err(|e| map_diesel_err(format!("get_many network={network}"), e))?;

            let by_tk: HashMap<TypeAndKey, Blob> = rows
                .into_iter()
                .map(|row| {
                    let (_, blob) = row.into_blob(true);
                    (blob.tk(), blob)
                })
                .collect();
            Ok(tks.iter().filter_map(|tk| by_tk.get(tk).cloned()).collect())
        })
        .await
    }

    async fn search(
        &mut self,
        filter: SearchFilter,
        criteria: LoadCriteria,
    ) -> StorageResult<HashMap<String, Vec<Blob>>> {
        self.state.ensure_open()?;

        let conn = Arc::clone(&self.conn);
        run_blocking("search", move || {
            use schema::network_blobs::dsl;

            let mut conn = conn.lock();
            let mut query = network_blobs::table.into_boxed::<Sqlite>();
            if let Some(network_id) = &filter.network_id {
                query = query.filter(dsl::network_id.eq(network_id.clone()));
            }
            if !filter.types.is_empty() {
                let types: Vec<String> = filter.types.iter().cloned().collect();
                query = query.filter(dsl::record_type.eq_any(types));
            }
            match filter.key_predicate() {
                KeyPredicate::Any => {},
                KeyPredicate::In(keys) => {
                    let keys: Vec<String> = keys.iter().cloned().collect();
                    query = query.filter(dsl::key.eq_any(keys));
                },
                KeyPredicate::Prefix(prefix) => {
                    let (low, high) = prefix_bounds(prefix);
                    query = query.filter(dsl::key.ge(low));
                    if let Some(high) = high {
                        query = query.filter(dsl::key.lt(high));
                    }
                },
            }

            let rows: Vec<BlobRow> = query
                .order((dsl::network_id.asc(), dsl::record_type.asc(), dsl::key.asc()))
                .load(&mut *conn)
                .map_err(|e| map_diesel_err("search", e))?;

            let mut grouped: HashMap<String, Vec<Blob>> = HashMap::new();
            for row in rows {
                let (network_id, blob) = row.into_blob(criteria.load_value);
                grouped.entry(network_id).or_default().push(blob);
            }
            Ok(grouped)
        })
        .await
    }

    async fn write(&mut self, network_id: &str, blobs: Vec<BlobWrite>) -> StorageResult<()> {
        self.ensure_writable()?;
        if blobs.is_empty() {
            return Ok(());
        }

        let conn = Arc::clone(&self.conn);
        let network = network_id.to_owned();
        run_blocking("write", move || {
            use schema::network_blobs::dsl;

            let mut conn = conn.lock();
            let context = || format!("write network={network}");

            let tks: Vec<TypeAndKey> = blobs.iter().map(BlobWrite::tk).collect();
            let existing: HashMap<TypeAndKey, u64> = network_blobs::table
                .select((dsl::record_type, dsl::key, dsl::version))
                .filter(dsl::network_id.eq(&network))
                .filter(tk_disjunction(&tks))
                .load::<(String, String, i64)>(&mut *conn)
                .map_err(|e| map_diesel_err(context(), e))?
                .into_iter()
                .map(|(typ, key, version)| (TypeAndKey::new(typ, key), version as u64))
                .collect();

            let (updates, inserts): (Vec<_>, Vec<_>) =
                blobs.into_iter().partition(|write| existing.contains_key(&write.tk()));

            for write in updates {
                let current = existing.get(&write.tk()).copied();
                let version = write.version.resolve(current) as i64;
                diesel::update(
                    network_blobs::table
                        .filter(dsl::network_id.eq(&network))
                        .filter(dsl::record_type.eq(&write.typ))
                        .filter(dsl::key.eq(&write.key)),
                )
                .set((
                    dsl::value.eq(write.value.as_ref().map(|bytes| bytes.to_vec())),
                    dsl::version.eq(version),
                ))
                .execute(&mut *conn)
                .map_err(|e| {
                    map_diesel_err(format!("write network={network} tk={}", write.tk()), e)
                })?;
            }

            if !inserts.is_empty() {
                let rows: Vec<BlobRow> = inserts
                    .into_iter()
                    .map(|write| BlobRow {
                        network_id: network.clone(),
                        record_type: write.typ,
                        key: write.key,
                        value: write.value.map(|bytes| bytes.to_vec()),
                        version: write.version.resolve(None) as i64,
                    })
                    .collect();
                diesel::insert_into(network_blobs::table)
                    .values(&rows)
                    .execute(&mut *conn)
                    .map_err(|e| map_diesel_err(context(), e))?;
            }
            Ok(())
        })
        .await
    }

    async fn increment_version(
        &mut self,
        network_id: &str,
        tk: &TypeAndKey,
    ) -> StorageResult<()> {
        self.ensure_writable()?;

        let conn = Arc::clone(&self.conn);
        let network = network_id.to_owned();
        let tk = tk.clone();
        run_blocking("increment_version", move || {
            use schema::network_blobs::dsl;

            let mut conn = conn.lock();
            // Upsert without touching the value column: a fresh row has no
            // payload, an existing payload is carried forward.
            diesel::insert_into(network_blobs::table)
                .values((
                    dsl::network_id.eq(&network),
                    dsl::record_type.eq(&tk.typ),
                    dsl::key.eq(&tk.key),
                    dsl::version.eq(1i64),
                ))
                .on_conflict((dsl::network_id, dsl::record_type, dsl::key))
                .do_update()
                .set(dsl::version.eq(dsl::version + 1i64))
                .execute(&mut *conn)
                .map_err(|e| {
                    map_diesel_err(format!("increment_version network={network} tk={tk}"), e)
                })?;
            Ok(())
        })
        .await
    }

    async fn get_existing_keys(
        &mut self,
        keys: &[String],
        filter: SearchFilter,
    ) -> StorageResult<Vec<String>> {
        self.state.ensure_open()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let conn = Arc::clone(&self.conn);
        let keys = keys.to_vec();
        run_blocking("get_existing_keys", move || {
            use schema::network_blobs::dsl;

            let mut conn = conn.lock();
            let mut query = network_blobs::table
                .select(dsl::key)
                .distinct()
                .filter(dsl::key.eq_any(keys))
                .into_boxed::<Sqlite>();
            if let Some(network_id) = filter.network_id {
                query = query.filter(dsl::network_id.eq(network_id));
            }
            query
                .order(dsl::key.asc())
                .load::<String>(&mut *conn)
                .map_err(|e| map_diesel_err("get_existing_keys", e))
        })
        .await
    }

    async fn delete(&mut self, network_id: &str, tks: &[TypeAndKey]) -> StorageResult<()> {
        self.ensure_writable()?;
        if tks.is_empty() {
            return Ok(());
        }

        let conn = Arc::clone(&self.conn);
        let network = network_id.to_owned();
        let tks = tks.to_vec();
        run_blocking("delete", move || {
            use schema::network_blobs::dsl;

            let mut conn = conn.lock();
            diesel::delete(
                network_blobs::table
                    .filter(dsl::network_id.eq(&network))
                    .filter(tk_disjunction(&tks)),
            )
            .execute(&mut *conn)
            .map_err(|e| map_diesel_err(format!("delete network={network}"), e))?;
            Ok(())
        })
        .await
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.state.ensure_open()?;

        let conn = Arc::clone(&self.conn);
        let outcome = run_blocking("commit", move || {
            let mut conn = conn.lock();
            AnsiTransactionManager::commit_transaction(&mut *conn)
                .map_err(|e| map_diesel_err("commit", e))
        })
        .await;

        match outcome {
            Ok(()) => {
                self.state = TransactionState::Committed;
                tracing::debug!("committed orm transaction");
                Ok(())
            },
            Err(err) => {
                self.state = TransactionState::RolledBack;
                tracing::warn!(error = %err, "orm commit failed; transaction rolled back");
                Err(err)
            },
        }
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.state.ensure_open()?;
        self.state = TransactionState::RolledBack;

        let conn = Arc::clone(&self.conn);
        run_blocking("rollback", move || {
            let mut conn = conn.lock();
            AnsiTransactionManager::rollback_transaction(&mut *conn)
                .map_err(|e| map_diesel_err("rollback", e))
        })
        .await
    }
}

/// Runs a blocking closure on the tokio blocking pool, flattening join
/// errors into the storage error taxonomy.
async fn run_blocking<T, F>(op: &'static str, f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| StorageError::backend_with_source(format!("{op}: blocking task failed"), err))?
}

fn establish(path: &PathBuf, read_only: bool) -> StorageResult<SqliteConnection> {
    let mut conn = SqliteConnection::establish(&path.to_string_lossy()).map_err(|err| {
        StorageError::backend_with_source(format!("connect to {}", path.display()), err)
    })?;
    conn.batch_execute(
        "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| map_diesel_err("establish", e))?;
    if read_only {
        conn.batch_execute("PRAGMA query_only = ON;")
            .map_err(|e| map_diesel_err("establish", e))?;
    }
    Ok(conn)
}

/// OR-of-(type AND key) predicate for a non-empty TK slice.
fn tk_disjunction(tks: &[TypeAndKey]) -> DynPredicate {
    use schema::network_blobs::dsl::{key, record_type};

    let mut predicate: Option<DynPredicate> = None;
    for tk in tks {
        let clause = record_type.eq(tk.typ.clone()).and(key.eq(tk.key.clone()));
        predicate = Some(match predicate {
            Some(prior) => Box::new(prior.or(clause)),
            None => Box::new(clause),
        });
    }
    // Callers check for the empty slice; an empty disjunction matches
    // nothing.
    predicate.unwrap_or_else(|| {
        Box::new(diesel::dsl::sql::<Bool>("1 = 0"))
    })
}

/// Maps a diesel error into the storage taxonomy: lock contention becomes
/// a retryable conflict, everything else a wrapped backend error.
fn map_diesel_err(context: impl Into<String>, err: diesel::result::Error) -> StorageError {
    if let diesel::result::Error::DatabaseError(_, info) = &err {
        let message = info.message();
        if message.contains("database is locked") || message.contains("database table is locked") {
            return StorageError::conflict(format!("{}: {message}", context.into()));
        }
    }
    StorageError::backend_with_source(context, err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn blob_row_conversion_respects_load_criteria() {
        let row = BlobRow {
            network_id: "n1".into(),
            record_type: "t1".into(),
            key: "k1".into(),
            value: Some(b"payload".to_vec()),
            version: 7,
        };
        let (network_id, blob) = row.clone().into_blob(true);
        assert_eq!(network_id, "n1");
        assert_eq!(blob.value.as_deref(), Some(b"payload".as_slice()));
        assert_eq!(blob.version, 7);

        let (_, stripped) = row.into_blob(false);
        assert_eq!(stripped.value, None);
        assert_eq!(stripped.version, 7);
    }
}
