//! Configuration for the relational blob-store engine.

use std::{path::PathBuf, time::Duration};

use gridstore::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

use crate::DEFAULT_TABLE;

/// Default wait on a locked database before surfacing a conflict (5
/// seconds).
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`SqlBlobStoreFactory`](crate::SqlBlobStoreFactory).
///
/// # Example
///
/// ```
/// use gridstore_sql::SqlStoreConfig;
///
/// let config = SqlStoreConfig::new("/var/lib/gridstore/blobs.db");
/// assert_eq!(config.table, "network_blobs");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlStoreConfig {
    /// Path of the SQLite database file; created if absent.
    pub path: PathBuf,

    /// Blob table name. Services sharing one database use distinct tables.
    #[serde(default = "default_table")]
    pub table: String,

    /// How long a connection waits on a locked database before the
    /// operation fails with a retryable conflict.
    #[serde(with = "humantime_serde", default = "default_busy_timeout")]
    pub busy_timeout: Duration,
}

impl SqlStoreConfig {
    /// Configuration with defaults for everything but the database path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), table: default_table(), busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }

    /// Returns the same configuration with a different table name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Rejects table names that cannot be spliced into SQL as a bare
    /// identifier.
    pub(crate) fn validate(&self) -> StorageResult<()> {
        let mut chars = self.table.chars();
        let head_ok =
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
        if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            Ok(())
        } else {
            Err(StorageError::invalid_input(format!(
                "table name {:?} is not a valid SQL identifier",
                self.table
            )))
        }
    }
}

fn default_table() -> String {
    DEFAULT_TABLE.to_owned()
}

fn default_busy_timeout() -> Duration {
    DEFAULT_BUSY_TIMEOUT
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SqlStoreConfig::new("/tmp/blobs.db");
        assert_eq!(config.table, DEFAULT_TABLE);
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_table_names() {
        for bad in ["", "1table", "blobs; DROP TABLE x", "blo-bs", "\"blobs\""] {
            let config = SqlStoreConfig::new("/tmp/blobs.db").with_table(bad);
            assert!(config.validate().is_err(), "table name {bad:?} should be rejected");
        }
        for good in ["network_blobs", "_private", "T2"] {
            let config = SqlStoreConfig::new("/tmp/blobs.db").with_table(good);
            assert!(config.validate().is_ok(), "table name {good:?} should be accepted");
        }
    }
}
