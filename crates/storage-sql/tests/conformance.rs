//! Conformance suite run against the relational engine.
//!
//! Every test gets a fresh database file; the `run_all` test additionally
//! proves the checks compose on one shared database.

#![allow(clippy::expect_used, clippy::panic)]

use gridstore::conformance;
use gridstore_sql::{SqlBlobStoreFactory, SqlStoreConfig};
use tempfile::TempDir;

async fn fresh_factory() -> (TempDir, SqlBlobStoreFactory) {
    let dir = TempDir::new().expect("create temp dir");
    let config = SqlStoreConfig::new(dir.path().join("blobs.db"));
    let factory = SqlBlobStoreFactory::open(config).await.expect("open factory");
    (dir, factory)
}

macro_rules! conformance_test {
    ($name:ident) => {
        #[tokio::test]
        async fn $name() {
            let (_dir, factory) = fresh_factory().await;
            conformance::$name(&factory).await;
        }
    };
}

conformance_test!(write_then_get_round_trips);
conformance_test!(insert_stores_caller_version_verbatim);
conformance_test!(update_version_protocol);
conformance_test!(exact_zero_version_is_persistable);
conformance_test!(increment_version_counts_from_one);
conformance_test!(increment_version_preserves_value);
conformance_test!(get_missing_returns_not_found);
conformance_test!(get_many_skips_missing_tks);
conformance_test!(search_filters_by_type);
conformance_test!(search_key_prefix_overrides_keys);
conformance_test!(search_spans_networks);
conformance_test!(search_metadata_only_omits_values);
conformance_test!(list_keys_returns_sorted_keys);
conformance_test!(get_existing_keys_returns_present_subset);
conformance_test!(get_existing_keys_scoped_to_network);
conformance_test!(delete_removes_rows_and_tolerates_missing);
conformance_test!(deleted_tk_can_be_recreated);
conformance_test!(commit_visibility);
conformance_test!(rollback_isolation);
conformance_test!(terminated_transaction_rejects_operations);
conformance_test!(read_only_transaction_rejects_writes);

#[tokio::test]
async fn run_all_on_shared_database() {
    let (_dir, factory) = fresh_factory().await;
    conformance::run_all(&factory).await;
}
