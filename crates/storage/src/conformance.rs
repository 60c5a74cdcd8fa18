//! Conformance test suite for [`BlobStoreFactory`] implementations.
//!
//! This module provides a set of async test functions that validate whether
//! a backend correctly satisfies the store contract — the versioning
//! protocol, search semantics, transaction lifecycle and isolation. Every
//! backend (in-memory, relational, ORM-backed) runs the same suite to
//! ensure interchangeability.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each conformance function with a
//! fresh factory:
//!
//! ```no_run
//! use gridstore::{conformance, MemoryBlobStoreFactory};
//!
//! #[tokio::test]
//! async fn write_round_trips() {
//!     conformance::write_then_get_round_trips(&MemoryBlobStoreFactory::new()).await;
//! }
//! ```
//!
//! Tests use distinct network ids, so a single factory may run the whole
//! suite via [`run_all`].

use crate::{
    filter::{LoadCriteria, SearchFilter},
    store::{BlobStore, BlobStoreFactory, TransactionOptions},
    types::{Blob, BlobWrite, TypeAndKey, WriteVersion},
};

async fn begin<F: BlobStoreFactory>(factory: &F) -> Box<dyn BlobStore> {
    factory
        .start_transaction(TransactionOptions::default())
        .await
        .expect("start_transaction should succeed")
}

/// Seeds the given blobs into one tenant and commits.
async fn seed<F: BlobStoreFactory>(factory: &F, network_id: &str, blobs: Vec<Blob>) {
    let mut store = begin(factory).await;
    store.create_or_update(network_id, blobs).await.expect("seed write");
    store.commit().await.expect("seed commit");
}

// ============================================================================
// Round-trip and version protocol
// ============================================================================

/// Writing then reading, in the same and in a later transaction, returns
/// the written value.
pub async fn write_then_get_round_trips<F: BlobStoreFactory>(factory: &F) {
    let tk = TypeAndKey::new("t1", "k1");
    let mut store = begin(factory).await;
    store
        .create_or_update("conf-roundtrip", vec![Blob::new("t1", "k1", "v1")])
        .await
        .expect("write");

    // Read-your-writes before commit.
    let blob = store.get("conf-roundtrip", &tk).await.expect("get in same transaction");
    assert_eq!(blob.value.as_deref(), Some(b"v1".as_slice()));
    store.commit().await.expect("commit");

    let mut store = begin(factory).await;
    let blob = store.get("conf-roundtrip", &tk).await.expect("get in later transaction");
    assert_eq!(blob.value.as_deref(), Some(b"v1".as_slice()));
    assert_eq!(blob.version, 0, "first insert with version 0 stores 0 verbatim");
    store.rollback().await.expect("rollback");
}

/// First insert stores the caller-supplied version verbatim, including 0.
pub async fn insert_stores_caller_version_verbatim<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-insert-version";
    let mut store = begin(factory).await;
    store
        .write(
            network,
            vec![
                BlobWrite::new("t1", "seeded", "v").with_version(7),
                BlobWrite::new("t1", "auto", "v"),
            ],
        )
        .await
        .expect("write");
    store.commit().await.expect("commit");

    let mut store = begin(factory).await;
    assert_eq!(store.get(network, &TypeAndKey::new("t1", "seeded")).await.expect("get").version, 7);
    assert_eq!(store.get(network, &TypeAndKey::new("t1", "auto")).await.expect("get").version, 0);
    store.rollback().await.expect("rollback");
}

/// The documented write scenario: auto bump on update, explicit override
/// honored.
pub async fn update_version_protocol<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-update-version";
    let tk = TypeAndKey::new("t1", "k1");

    seed(factory, network, vec![Blob::new("t1", "k1", "v1")]).await;
    let mut store = begin(factory).await;
    let blob = store.get(network, &tk).await.expect("get");
    assert_eq!((blob.value.as_deref(), blob.version), (Some(b"v1".as_slice()), 0));
    store.rollback().await.expect("rollback");

    seed(factory, network, vec![Blob::new("t1", "k1", "v2")]).await;
    let mut store = begin(factory).await;
    let blob = store.get(network, &tk).await.expect("get");
    assert_eq!((blob.value.as_deref(), blob.version), (Some(b"v2".as_slice()), 1));
    store.rollback().await.expect("rollback");

    seed(factory, network, vec![Blob::new("t1", "k1", "v3").with_version(100)]).await;
    let mut store = begin(factory).await;
    let blob = store.get(network, &tk).await.expect("get");
    assert_eq!((blob.value.as_deref(), blob.version), (Some(b"v3".as_slice()), 100));
    store.rollback().await.expect("rollback");
}

/// The tagged write form can persist version 0 on an update.
pub async fn exact_zero_version_is_persistable<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-exact-zero";
    let tk = TypeAndKey::new("t1", "k1");
    seed(factory, network, vec![Blob::new("t1", "k1", "v1").with_version(9)]).await;

    let mut store = begin(factory).await;
    store
        .write(
            network,
            vec![BlobWrite {
                typ: "t1".into(),
                key: "k1".into(),
                value: Some("v2".into()),
                version: WriteVersion::Exact(0),
            }],
        )
        .await
        .expect("write");
    store.commit().await.expect("commit");

    let mut store = begin(factory).await;
    assert_eq!(store.get(network, &tk).await.expect("get").version, 0);
    store.rollback().await.expect("rollback");
}

/// `increment_version` N times on an absent TK yields version N.
pub async fn increment_version_counts_from_one<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-increment";
    let tk = TypeAndKey::new("t1", "counter");

    for _ in 0..3 {
        let mut store = begin(factory).await;
        store.increment_version(network, &tk).await.expect("increment_version");
        store.commit().await.expect("commit");
    }

    let mut store = begin(factory).await;
    let blob = store.get(network, &tk).await.expect("get");
    assert_eq!(blob.version, 3);
    store.rollback().await.expect("rollback");
}

/// `increment_version` carries an existing value forward unchanged.
pub async fn increment_version_preserves_value<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-increment-value";
    let tk = TypeAndKey::new("t1", "k1");
    seed(factory, network, vec![Blob::new("t1", "k1", "payload").with_version(4)]).await;

    let mut store = begin(factory).await;
    store.increment_version(network, &tk).await.expect("increment_version");
    store.commit().await.expect("commit");

    let mut store = begin(factory).await;
    let blob = store.get(network, &tk).await.expect("get");
    assert_eq!(blob.version, 5);
    assert_eq!(blob.value.as_deref(), Some(b"payload".as_slice()));
    store.rollback().await.expect("rollback");
}

// ============================================================================
// Reads
// ============================================================================

/// `get` on an absent TK returns the NotFound sentinel.
pub async fn get_missing_returns_not_found<F: BlobStoreFactory>(factory: &F) {
    let mut store = begin(factory).await;
    let result = store.get("conf-missing", &TypeAndKey::new("t1", "ghost")).await;
    assert!(
        result.as_ref().err().is_some_and(|e| e.is_not_found()),
        "expected NotFound, got: {result:?}"
    );
    store.rollback().await.expect("rollback");
}

/// `get_many` silently skips TKs with no matching row.
pub async fn get_many_skips_missing_tks<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-getmany";
    seed(factory, network, vec![Blob::new("t1", "k1", "v1"), Blob::new("t2", "k2", "v2")]).await;

    let mut store = begin(factory).await;
    let blobs = store
        .get_many(
            network,
            &[
                TypeAndKey::new("t1", "k1"),
                TypeAndKey::new("t9", "ghost"),
                TypeAndKey::new("t2", "k2"),
            ],
        )
        .await
        .expect("get_many");
    let found: Vec<(&str, &str)> =
        blobs.iter().map(|b| (b.typ.as_str(), b.key.as_str())).collect();
    assert_eq!(found, vec![("t1", "k1"), ("t2", "k2")]);
    store.rollback().await.expect("rollback");
}

// ============================================================================
// Search
// ============================================================================

async fn seed_search_fixture<F: BlobStoreFactory>(factory: &F, network: &str) {
    seed(
        factory,
        network,
        vec![
            Blob::new("t1", "k1", "a"),
            Blob::new("t1", "k2", "b"),
            Blob::new("t2", "k1", "c"),
        ],
    )
    .await;
}

/// `types` restricts results to the given record kinds.
pub async fn search_filters_by_type<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-search-type";
    seed_search_fixture(factory, network).await;

    let mut store = begin(factory).await;
    let results = store
        .search(SearchFilter::within(network).with_types(["t1"]), LoadCriteria::default())
        .await
        .expect("search");
    let found: Vec<(&str, &str)> =
        results[network].iter().map(|b| (b.typ.as_str(), b.key.as_str())).collect();
    assert_eq!(found, vec![("t1", "k1"), ("t1", "k2")]);
    store.rollback().await.expect("rollback");
}

/// A key prefix replaces any key set entirely.
pub async fn search_key_prefix_overrides_keys<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-search-prefix";
    seed_search_fixture(factory, network).await;

    let mut store = begin(factory).await;
    let filter = SearchFilter::within(network).with_keys(["k2"]).with_key_prefix("k1");
    let results = store.search(filter, LoadCriteria::default()).await.expect("search");
    let found: Vec<(&str, &str)> =
        results[network].iter().map(|b| (b.typ.as_str(), b.key.as_str())).collect();
    assert_eq!(found, vec![("t1", "k1"), ("t2", "k1")]);
    store.rollback().await.expect("rollback");
}

/// A filter without a network id spans tenants and groups results per
/// tenant.
pub async fn search_spans_networks<F: BlobStoreFactory>(factory: &F) {
    seed(factory, "conf-span-a", vec![Blob::new("t1", "k1", "a")]).await;
    seed(factory, "conf-span-b", vec![Blob::new("t1", "k1", "b")]).await;

    let mut store = begin(factory).await;
    let results = store
        .search(SearchFilter::all().with_types(["t1"]), LoadCriteria::default())
        .await
        .expect("search");
    assert_eq!(results["conf-span-a"].len(), 1);
    assert_eq!(results["conf-span-b"].len(), 1);
    assert_eq!(results["conf-span-a"][0].value.as_deref(), Some(b"a".as_slice()));
    assert_eq!(results["conf-span-b"][0].value.as_deref(), Some(b"b".as_slice()));
    store.rollback().await.expect("rollback");
}

/// Metadata-only criteria returns types, keys and versions but no values.
pub async fn search_metadata_only_omits_values<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-search-meta";
    seed(factory, network, vec![Blob::new("t1", "k1", "payload").with_version(3)]).await;

    let mut store = begin(factory).await;
    let results = store
        .search(SearchFilter::within(network), LoadCriteria::metadata_only())
        .await
        .expect("search");
    let blob = &results[network][0];
    assert_eq!(blob.value, None, "metadata-only search must not fetch values");
    assert_eq!((blob.typ.as_str(), blob.key.as_str(), blob.version), ("t1", "k1", 3));
    store.rollback().await.expect("rollback");
}

/// `list_keys` enumerates one tenant and type in sorted order.
pub async fn list_keys_returns_sorted_keys<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-list-keys";
    seed(
        factory,
        network,
        vec![
            Blob::new("t1", "kb", "1"),
            Blob::new("t1", "ka", "2"),
            Blob::new("t2", "kz", "3"),
        ],
    )
    .await;

    let mut store = begin(factory).await;
    let keys = store.list_keys(network, "t1").await.expect("list_keys");
    assert_eq!(keys, vec!["ka".to_owned(), "kb".to_owned()]);
    store.rollback().await.expect("rollback");
}

// ============================================================================
// Existing keys and delete
// ============================================================================

/// Returns exactly the requested keys that exist, deduplicated.
pub async fn get_existing_keys_returns_present_subset<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-existing";
    // k1 exists under two types; it must come back once.
    seed(factory, network, vec![Blob::new("t1", "k1", "a"), Blob::new("t2", "k1", "b")]).await;

    let mut store = begin(factory).await;
    let keys = store
        .get_existing_keys(&["k1".to_owned(), "k9".to_owned()], SearchFilter::all())
        .await
        .expect("get_existing_keys");
    assert_eq!(keys, vec!["k1".to_owned()]);
    store.rollback().await.expect("rollback");
}

/// A network-scoped filter restricts existence checks to that tenant.
pub async fn get_existing_keys_scoped_to_network<F: BlobStoreFactory>(factory: &F) {
    seed(factory, "conf-existing-a", vec![Blob::new("t1", "k1", "a")]).await;
    seed(factory, "conf-existing-b", vec![Blob::new("t1", "k2", "b")]).await;

    let mut store = begin(factory).await;
    let keys = store
        .get_existing_keys(
            &["k1".to_owned(), "k2".to_owned()],
            SearchFilter::within("conf-existing-a"),
        )
        .await
        .expect("get_existing_keys");
    assert_eq!(keys, vec!["k1".to_owned()]);
    store.rollback().await.expect("rollback");
}

/// Deleting removes rows; deleting an absent TK is not an error.
pub async fn delete_removes_rows_and_tolerates_missing<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-delete";
    seed(factory, network, vec![Blob::new("t1", "k1", "v")]).await;

    let mut store = begin(factory).await;
    store
        .delete(network, &[TypeAndKey::new("t1", "k1"), TypeAndKey::new("t1", "ghost")])
        .await
        .expect("delete with a missing TK should succeed");
    store.commit().await.expect("commit");

    let mut store = begin(factory).await;
    let result = store.get(network, &TypeAndKey::new("t1", "k1")).await;
    assert!(result.unwrap_err().is_not_found());
    store.rollback().await.expect("rollback");
}

/// A deleted TK is immediately available for re-creation, with insert
/// version semantics.
pub async fn deleted_tk_can_be_recreated<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-recreate";
    let tk = TypeAndKey::new("t1", "k1");
    seed(factory, network, vec![Blob::new("t1", "k1", "old").with_version(41)]).await;

    let mut store = begin(factory).await;
    store.delete(network, std::slice::from_ref(&tk)).await.expect("delete");
    store.commit().await.expect("commit");

    seed(factory, network, vec![Blob::new("t1", "k1", "new")]).await;
    let mut store = begin(factory).await;
    let blob = store.get(network, &tk).await.expect("get");
    assert_eq!(blob.version, 0, "re-created row follows insert semantics");
    assert_eq!(blob.value.as_deref(), Some(b"new".as_slice()));
    store.rollback().await.expect("rollback");
}

// ============================================================================
// Transaction lifecycle
// ============================================================================

/// Uncommitted writes are invisible to a concurrently opened transaction;
/// a transaction opened after commit sees them.
pub async fn commit_visibility<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-visibility";
    let tk = TypeAndKey::new("t1", "k1");

    let mut writer = begin(factory).await;
    writer.create_or_update(network, vec![Blob::new("t1", "k1", "v1")]).await.expect("write");

    let mut reader = begin(factory).await;
    let result = reader.get(network, &tk).await;
    assert!(
        result.as_ref().err().is_some_and(|e| e.is_not_found()),
        "uncommitted write must be invisible, got: {result:?}"
    );
    reader.rollback().await.expect("rollback reader");

    writer.commit().await.expect("commit");

    let mut reader = begin(factory).await;
    let blob = reader.get(network, &tk).await.expect("get after commit");
    assert_eq!(blob.value.as_deref(), Some(b"v1".as_slice()));
    reader.rollback().await.expect("rollback");
}

/// After rollback, a fresh transaction sees the pre-transaction state
/// exactly.
pub async fn rollback_isolation<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-rollback";
    let tk = TypeAndKey::new("t1", "k1");
    seed(factory, network, vec![Blob::new("t1", "k1", "before")]).await;

    let mut store = begin(factory).await;
    store.create_or_update(network, vec![Blob::new("t1", "k1", "after")]).await.expect("write");
    store.delete(network, &[TypeAndKey::new("t1", "other")]).await.expect("delete");
    store.rollback().await.expect("rollback");

    let mut store = begin(factory).await;
    let blob = store.get(network, &tk).await.expect("get");
    assert_eq!(blob.value.as_deref(), Some(b"before".as_slice()));
    assert_eq!(blob.version, 0);
    store.rollback().await.expect("rollback");
}

/// Every operation on a terminated transaction fails with the
/// no-transaction error, never a panic.
pub async fn terminated_transaction_rejects_operations<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-terminated";

    let mut store = begin(factory).await;
    store.commit().await.expect("commit");
    assert!(store.commit().await.unwrap_err().is_no_transaction(), "double commit");
    assert!(store.rollback().await.unwrap_err().is_no_transaction(), "rollback after commit");
    assert!(store
        .get_many(network, &[TypeAndKey::new("t1", "k1")])
        .await
        .unwrap_err()
        .is_no_transaction());
    assert!(store
        .create_or_update(network, vec![Blob::new("t1", "k1", "v")])
        .await
        .unwrap_err()
        .is_no_transaction());

    let mut store = begin(factory).await;
    store.rollback().await.expect("rollback");
    assert!(store.rollback().await.unwrap_err().is_no_transaction(), "double rollback");
    assert!(store.commit().await.unwrap_err().is_no_transaction(), "commit after rollback");
}

/// Read-only transactions reject mutations but serve reads.
pub async fn read_only_transaction_rejects_writes<F: BlobStoreFactory>(factory: &F) {
    let network = "conf-read-only";
    seed(factory, network, vec![Blob::new("t1", "k1", "v")]).await;

    let mut store = factory
        .start_transaction(TransactionOptions::read_only())
        .await
        .expect("start read-only transaction");

    let blob = store.get(network, &TypeAndKey::new("t1", "k1")).await.expect("read");
    assert_eq!(blob.value.as_deref(), Some(b"v".as_slice()));

    let result = store.create_or_update(network, vec![Blob::new("t1", "k2", "v")]).await;
    assert!(result.is_err(), "write in read-only transaction must fail");
    let result = store.delete(network, &[TypeAndKey::new("t1", "k1")]).await;
    assert!(result.is_err(), "delete in read-only transaction must fail");

    store.rollback().await.expect("rollback");
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Runs the full conformance suite against the given factory.
///
/// Tests use distinct network ids, so one factory (and one underlying
/// database) can host the entire run:
///
/// ```no_run
/// use gridstore::{conformance, MemoryBlobStoreFactory};
///
/// #[tokio::test]
/// async fn memory_engine_conformance() {
///     conformance::run_all(&MemoryBlobStoreFactory::new()).await;
/// }
/// ```
pub async fn run_all<F: BlobStoreFactory>(factory: &F) {
    write_then_get_round_trips(factory).await;
    insert_stores_caller_version_verbatim(factory).await;
    update_version_protocol(factory).await;
    exact_zero_version_is_persistable(factory).await;
    increment_version_counts_from_one(factory).await;
    increment_version_preserves_value(factory).await;

    get_missing_returns_not_found(factory).await;
    get_many_skips_missing_tks(factory).await;

    search_filters_by_type(factory).await;
    search_key_prefix_overrides_keys(factory).await;
    search_spans_networks(factory).await;
    search_metadata_only_omits_values(factory).await;
    list_keys_returns_sorted_keys(factory).await;

    get_existing_keys_returns_present_subset(factory).await;
    get_existing_keys_scoped_to_network(factory).await;
    delete_removes_rows_and_tolerates_missing(factory).await;
    deleted_tk_can_be_recreated(factory).await;

    commit_visibility(factory).await;
    rollback_isolation(factory).await;
    terminated_transaction_rejects_operations(factory).await;
    read_only_transaction_rejects_writes(factory).await;
}
