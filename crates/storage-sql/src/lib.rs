//! Relational implementation of the gridstore contract.
//!
//! This crate provides [`SqlBlobStoreFactory`], a blob-store engine backed
//! by one SQLite table with hand-built parameterized SQL. Each
//! [`BlobStore`] handle wraps one dedicated database connection with an
//! open native transaction, so commit and rollback map directly onto the
//! database's own transaction protocol.
//!
//! # Physical schema
//!
//! ```text
//! network_id TEXT NOT NULL      ─┐
//! type       TEXT NOT NULL       ├─ PRIMARY KEY
//! "key"      TEXT NOT NULL      ─┘   (quoted, reserved word)
//! value      BLOB
//! version    BIGINT NOT NULL DEFAULT 0
//! ```
//!
//! This layout is a compatibility contract: any engine pointed at the same
//! table (see `gridstore-orm`) reads and writes it unchanged, so a
//! deployment can switch engines without a data migration.
//!
//! # Blocking calls
//!
//! SQLite calls are synchronous; every operation runs them inside
//! `tokio::task::spawn_blocking` so the async executor is never blocked on
//! database I/O or the connection lock.
//!
//! # Example
//!
//! ```no_run
//! use gridstore::{Blob, BlobStoreFactory, TransactionOptions};
//! use gridstore_sql::{SqlBlobStoreFactory, SqlStoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = SqlBlobStoreFactory::open(SqlStoreConfig::new("blobs.db")).await?;
//!
//!     let mut store = factory.start_transaction(TransactionOptions::default()).await?;
//!     store.create_or_update("n1", vec![Blob::new("t1", "k1", "v1")]).await?;
//!     store.commit().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use gridstore::{
    Blob, BlobStore, BlobStoreFactory, BlobWrite, Isolation, KeyPredicate, LoadCriteria,
    SearchFilter, StorageError, StorageResult, TransactionOptions, TransactionState, TypeAndKey,
    prefix_bounds,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params, params_from_iter, types::Value};

mod config;

pub use config::SqlStoreConfig;

/// Table name both relational engines agree on by default.
pub const DEFAULT_TABLE: &str = "network_blobs";

/// SQLite-backed implementation of [`BlobStoreFactory`].
///
/// Opening the factory creates the blob table idempotently, wrapped in its
/// own transaction. Every [`start_transaction`](BlobStoreFactory::start_transaction)
/// opens a dedicated connection to the database file; SQLite's WAL mode
/// lets readers proceed while one writer holds the write lock.
#[derive(Clone)]
pub struct SqlBlobStoreFactory {
    config: Arc<SqlStoreConfig>,
    table: Arc<str>,
}

impl std::fmt::Debug for SqlBlobStoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBlobStoreFactory")
            .field("path", &self.config.path)
            .field("table", &self.table)
            .finish()
    }
}

impl SqlBlobStoreFactory {
    /// Opens (or creates) the database and ensures the blob table exists.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidInput`] for a table name that is not
    /// a bare SQL identifier, or a backend error if the database cannot be
    /// opened or the schema cannot be created.
    pub async fn open(config: SqlStoreConfig) -> StorageResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let table: Arc<str> = Arc::from(config.table.as_str());

        let init_config = Arc::clone(&config);
        let init_table = Arc::clone(&table);
        run_blocking("init_schema", move || init_schema(&init_config, &init_table)).await?;
        tracing::debug!(path = %config.path.display(), table = %table, "opened sql blob store");

        Ok(Self { config, table })
    }
}

#[async_trait]
impl BlobStoreFactory for SqlBlobStoreFactory {
    async fn start_transaction(
        &self,
        options: TransactionOptions,
    ) -> StorageResult<Box<dyn BlobStore>> {
        let config = Arc::clone(&self.config);
        let conn = run_blocking("start_transaction", move || {
            let conn = open_connection(&config, options.read_only)?;
            let begin = match options.isolation {
                // SQLite transactions are serializable either way; taking
                // the write lock up front surfaces write-write conflicts
                // at begin time instead of commit time.
                Some(Isolation::Serializable) => "BEGIN IMMEDIATE",
                Some(Isolation::ReadCommitted) | None => "BEGIN DEFERRED",
            };
            conn.execute_batch(begin)
                .map_err(|err| map_sqlite_err("start_transaction", err))?;
            Ok(conn)
        })
        .await?;

        tracing::debug!(read_only = options.read_only, "started sql transaction");
        Ok(Box::new(SqlBlobStore {
            conn: Arc::new(Mutex::new(conn)),
            table: Arc::clone(&self.table),
            options,
            state: TransactionState::Open,
        }))
    }
}

/// One open database transaction.
///
/// The handle owns its connection until terminated; dropping an
/// unterminated handle closes the connection, which rolls the transaction
/// back.
struct SqlBlobStore {
    conn: Arc<Mutex<Connection>>,
    table: Arc<str>,
    options: TransactionOptions,
    state: TransactionState,
}

impl SqlBlobStore {
    fn ensure_writable(&self) -> StorageResult<()> {
        self.state.ensure_open()?;
        if self.options.read_only {
            return Err(StorageError::invalid_input("mutation in a read-only transaction"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for SqlBlobStore {
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
        let table = Arc::clone(&self.table);
        let network = network_id.to_owned();
        let tks = tks.to_vec();
        run_blocking("get_many", move || {
            let conn = conn.lock();
            let context = || format!("get_many network={network}");

            let sql = format!(
                "SELECT type, \"key\", value, version FROM {table} \
                 WHERE network_id = ? AND {}",
                tk_disjunction(tks.len())
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| map_sqlite_err(context(), e))?;
            let rows = stmt
                .query_map(params_from_iter(tk_params(&network, &tks)), |row| {
                    Ok(Blob {
                        typ: row.get(0)?,
                        key: row.get(1)?,
                        value: row.get::<_, Option<Vec<u8>>>(2)?.map(Bytes::from),
                        version: row.get::<_, i64>(3)? as u64,
                    })
                })
                .map_err(|e| map_sqlite_err(context(), e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlite_err(context(), e))?;

            // Best-effort semantics in input order: absent TKs are skipped.
            let by_tk: HashMap<TypeAndKey, Blob> =
                rows.into_iter().map(|blob| (blob.tk(), blob)).collect();
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
        let table = Arc::clone(&self.table);
        run_blocking("search", move || {
            let conn = conn.lock();
            let (sql, params) = build_search_sql(&table, &filter, criteria);
            let mut stmt = conn.prepare(&sql).map_err(|e| map_sqlite_err("search", e))?;
            let rows = stmt
                .query_map(params_from_iter(params), |row| {
                    let network_id: String = row.get(0)?;
                    let value = if criteria.load_value {
                        row.get::<_, Option<Vec<u8>>>(4)?.map(Bytes::from)
                    } else {
                        None
                    };
                    Ok((
                        network_id,
                        Blob {
                            typ: row.get(1)?,
                            key: row.get(2)?,
                            value,
                            version: row.get::<_, i64>(3)? as u64,
                        },
                    ))
                })
                .map_err(|e| map_sqlite_err("search", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlite_err("search", e))?;

            // Rows arrive ordered by (network_id, type, key), so per-network
            // vectors are already sorted.
            let mut grouped: HashMap<String, Vec<Blob>> = HashMap::new();
            for (network_id, blob) in rows {
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
        let table = Arc::clone(&self.table);
        let network = network_id.to_owned();
        run_blocking("write", move || {
            let conn = conn.lock();
            let context = || format!("write network={network}");

            // Read existing versions for every target TK in one query, then
            // partition into updates and inserts. A failure here aborts the
            // whole call before any write is issued.
            let tks: Vec<TypeAndKey> = blobs.iter().map(BlobWrite::tk).collect();
            let sql = format!(
                "SELECT type, \"key\", version FROM {table} WHERE network_id = ? AND {}",
                tk_disjunction(tks.len())
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| map_sqlite_err(context(), e))?;
            let existing: HashMap<TypeAndKey, u64> = stmt
                .query_map(params_from_iter(tk_params(&network, &tks)), |row| {
                    Ok((
                        TypeAndKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                        row.get::<_, i64>(2)? as u64,
                    ))
                })
                .map_err(|e| map_sqlite_err(context(), e))?
                .collect::<Result<HashMap<_, _>, _>>()
                .map_err(|e| map_sqlite_err(context(), e))?;

            let (updates, inserts): (Vec<_>, Vec<_>) =
                blobs.into_iter().partition(|write| existing.contains_key(&write.tk()));

            if !updates.is_empty() {
                let sql = format!(
                    "UPDATE {table} SET value = ?, version = ? \
                     WHERE network_id = ? AND type = ? AND \"key\" = ?"
                );
                let mut stmt = conn.prepare(&sql).map_err(|e| map_sqlite_err(context(), e))?;
                for write in updates {
                    let current = existing.get(&write.tk()).copied();
                    let version = write.version.resolve(current) as i64;
                    stmt.execute(params![
                        write.value.as_deref(),
                        version,
                        network,
                        write.typ,
                        write.key,
                    ])
                    .map_err(|e| {
                        map_sqlite_err(format!("write network={network} tk={}", write.tk()), e)
                    })?;
                }
            }

            if !inserts.is_empty() {
                let rows = vec!["(?, ?, ?, ?, ?)"; inserts.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {table} (network_id, type, \"key\", value, version) \
                     VALUES {rows}"
                );
                let mut values: Vec<Value> = Vec::with_capacity(inserts.len() * 5);
                for write in inserts {
                    let version = write.version.resolve(None) as i64;
                    values.push(Value::from(network.clone()));
                    values.push(Value::from(write.typ));
                    values.push(Value::from(write.key));
                    values.push(match write.value {
                        Some(bytes) => Value::Blob(bytes.to_vec()),
                        None => Value::Null,
                    });
                    values.push(Value::from(version));
                }
                conn.execute(&sql, params_from_iter(values))
                    .map_err(|e| map_sqlite_err(context(), e))?;
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
        let table = Arc::clone(&self.table);
        let network = network_id.to_owned();
        let tk = tk.clone();
        run_blocking("increment_version", move || {
            let conn = conn.lock();
            // The one place concurrency control is delegated to the
            // database's atomic upsert; the value column is untouched, so
            // an existing payload is carried forward.
            let sql = format!(
                "INSERT INTO {table} (network_id, type, \"key\", version) VALUES (?, ?, ?, 1) \
                 ON CONFLICT (network_id, type, \"key\") DO UPDATE SET version = version + 1"
            );
            conn.execute(&sql, params![network, tk.typ, tk.key]).map_err(|e| {
                map_sqlite_err(format!("increment_version network={network} tk={tk}"), e)
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
        let table = Arc::clone(&self.table);
        let keys = keys.to_vec();
        run_blocking("get_existing_keys", move || {
            let conn = conn.lock();
            let mut clauses = vec![format!("\"key\" IN ({})", placeholders(keys.len()))];
            let mut values: Vec<Value> = keys.into_iter().map(Value::from).collect();
            if let Some(network_id) = filter.network_id {
                clauses.push("network_id = ?".to_owned());
                values.push(Value::from(network_id));
            }
            let sql = format!(
                "SELECT DISTINCT \"key\" FROM {table} WHERE {} ORDER BY \"key\"",
                clauses.join(" AND ")
            );
            let mut stmt =
                conn.prepare(&sql).map_err(|e| map_sqlite_err("get_existing_keys", e))?;
            let result = stmt
                .query_map(params_from_iter(values), |row| row.get::<_, String>(0))
                .map_err(|e| map_sqlite_err("get_existing_keys", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| map_sqlite_err("get_existing_keys", e));
            result
        })
        .await
    }

    async fn delete(&mut self, network_id: &str, tks: &[TypeAndKey]) -> StorageResult<()> {
        self.ensure_writable()?;
        if tks.is_empty() {
            return Ok(());
        }

        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.table);
        let network = network_id.to_owned();
        let tks = tks.to_vec();
        run_blocking("delete", move || {
            let conn = conn.lock();
            let sql = format!(
                "DELETE FROM {table} WHERE network_id = ? AND {}",
                tk_disjunction(tks.len())
            );
            conn.execute(&sql, params_from_iter(tk_params(&network, &tks)))
                .map_err(|e| map_sqlite_err(format!("delete network={network}"), e))?;
            Ok(())
        })
        .await
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.state.ensure_open()?;

        let conn = Arc::clone(&self.conn);
        let outcome = run_blocking("commit", move || {
            let conn = conn.lock();
            match conn.execute_batch("COMMIT") {
                Ok(()) => Ok(()),
                Err(err) => {
                    // The handle is terminated either way; make sure the
                    // connection is not left mid-transaction.
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(map_sqlite_err("commit", err))
                },
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                self.state = TransactionState::Committed;
                tracing::debug!("committed sql transaction");
                Ok(())
            },
            Err(err) => {
                self.state = TransactionState::RolledBack;
                tracing::warn!(error = %err, "sql commit failed; transaction rolled back");
                Err(err)
            },
        }
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.state.ensure_open()?;
        self.state = TransactionState::RolledBack;

        let conn = Arc::clone(&self.conn);
        run_blocking("rollback", move || {
            let conn = conn.lock();
            conn.execute_batch("ROLLBACK").map_err(|e| map_sqlite_err("rollback", e))
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

fn open_connection(config: &SqlStoreConfig, read_only: bool) -> StorageResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(&config.path, flags)
        .map_err(|e| map_sqlite_err("open_connection", e))?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
        .map_err(|e| map_sqlite_err("open_connection", e))?;
    conn.busy_timeout(config.busy_timeout).map_err(|e| map_sqlite_err("open_connection", e))?;
    if read_only {
        conn.execute_batch("PRAGMA query_only = ON;")
            .map_err(|e| map_sqlite_err("open_connection", e))?;
    }
    Ok(conn)
}

/// Creates the blob table if it does not exist, inside its own
/// transaction.
fn init_schema(config: &SqlStoreConfig, table: &str) -> StorageResult<()> {
    let mut conn = open_connection(config, false)?;
    let tx = conn.transaction().map_err(|e| map_sqlite_err("init_schema", e))?;
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            network_id TEXT NOT NULL,
            type       TEXT NOT NULL,
            \"key\"    TEXT NOT NULL,
            value      BLOB,
            version    BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (network_id, type, \"key\")
        );"
    );
    tx.execute_batch(&ddl).map_err(|e| map_sqlite_err("init_schema", e))?;
    tx.commit().map_err(|e| map_sqlite_err("init_schema", e))
}

/// OR-of-(type AND key) clause for `count` TKs, parenthesized.
fn tk_disjunction(count: usize) -> String {
    let clause = vec!["(type = ? AND \"key\" = ?)"; count].join(" OR ");
    format!("({clause})")
}

/// Parameters matching [`tk_disjunction`], led by the network id.
fn tk_params(network_id: &str, tks: &[TypeAndKey]) -> Vec<Value> {
    let mut values = Vec::with_capacity(1 + tks.len() * 2);
    values.push(Value::from(network_id.to_owned()));
    for tk in tks {
        values.push(Value::from(tk.typ.clone()));
        values.push(Value::from(tk.key.clone()));
    }
    values
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// AND-conjunction of the filter's optional predicates, with deterministic
/// parameter order (network, types, keys/prefix).
fn build_search_sql(
    table: &str,
    filter: &SearchFilter,
    criteria: LoadCriteria,
) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(network_id) = &filter.network_id {
        clauses.push("network_id = ?".to_owned());
        values.push(Value::from(network_id.clone()));
    }
    if !filter.types.is_empty() {
        clauses.push(format!("type IN ({})", placeholders(filter.types.len())));
        values.extend(filter.types.iter().cloned().map(Value::from));
    }
    match filter.key_predicate() {
        KeyPredicate::Any => {},
        KeyPredicate::In(keys) => {
            clauses.push(format!("\"key\" IN ({})", placeholders(keys.len())));
            values.extend(keys.iter().cloned().map(Value::from));
        },
        KeyPredicate::Prefix(prefix) => {
            let (low, high) = prefix_bounds(prefix);
            clauses.push("\"key\" >= ?".to_owned());
            values.push(Value::from(low));
            if let Some(high) = high {
                clauses.push("\"key\" < ?".to_owned());
                values.push(Value::from(high));
            }
        },
    }

    let columns = if criteria.load_value {
        "network_id, type, \"key\", version, value"
    } else {
        "network_id, type, \"key\", version"
    };
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {columns} FROM {table}{where_sql} ORDER BY network_id, type, \"key\""
    );
    (sql, values)
}

/// Maps a SQLite error into the storage taxonomy: lock contention becomes
/// a retryable conflict, everything else a wrapped backend error.
fn map_sqlite_err(context: impl Into<String>, err: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if matches!(
            failure.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return StorageError::conflict(format!("{}: {err}", context.into()));
        }
    }
    StorageError::backend_with_source(context, err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tk_disjunction_shapes() {
        assert_eq!(tk_disjunction(1), "((type = ? AND \"key\" = ?))");
        assert_eq!(
            tk_disjunction(2),
            "((type = ? AND \"key\" = ?) OR (type = ? AND \"key\" = ?))"
        );
    }

    #[test]
    fn tk_params_lead_with_network() {
        let tks = vec![TypeAndKey::new("t1", "k1"), TypeAndKey::new("t2", "k2")];
        let values = tk_params("n1", &tks);
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], Value::from("n1".to_owned()));
        assert_eq!(values[1], Value::from("t1".to_owned()));
        assert_eq!(values[4], Value::from("k2".to_owned()));
    }

    #[test]
    fn search_sql_empty_filter_scans_everything() {
        let (sql, values) =
            build_search_sql("network_blobs", &SearchFilter::all(), LoadCriteria::default());
        assert_eq!(
            sql,
            "SELECT network_id, type, \"key\", version, value FROM network_blobs \
             ORDER BY network_id, type, \"key\""
        );
        assert!(values.is_empty());
    }

    #[test]
    fn search_sql_composes_predicates_in_order() {
        let filter = SearchFilter::within("n1").with_types(["t1", "t2"]).with_keys(["k1"]);
        let (sql, values) =
            build_search_sql("network_blobs", &filter, LoadCriteria::metadata_only());
        assert_eq!(
            sql,
            "SELECT network_id, type, \"key\", version FROM network_blobs \
             WHERE network_id = ? AND type IN (?, ?) AND \"key\" IN (?) \
             ORDER BY network_id, type, \"key\""
        );
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn search_sql_prefix_replaces_keys() {
        let filter = SearchFilter::all().with_keys(["ignored"]).with_key_prefix("k1");
        let (sql, values) = build_search_sql("network_blobs", &filter, LoadCriteria::default());
        assert!(sql.contains("\"key\" >= ? AND \"key\" < ?"), "got: {sql}");
        assert!(!sql.contains("IN"), "key set must be replaced by the prefix: {sql}");
        assert_eq!(values[0], Value::from("k1".to_owned()));
        assert_eq!(values[1], Value::from("k2".to_owned()));
    }

    #[test]
    fn invalid_table_name_is_rejected_before_touching_disk() {
        let config = SqlStoreConfig::new("/nonexistent/nope.db").with_table("bad name");
        assert!(config.validate().is_err());
    }
}
