//! Conformance suite run against the in-memory engine.
//!
//! Each test function corresponds to a single conformance check, providing
//! fine-grained failure reporting. The `run_all` test exercises the full
//! suite against one shared factory to verify the checks compose.

#![allow(clippy::expect_used, clippy::panic)]

use gridstore::{MemoryBlobStoreFactory, conformance};

// ============================================================================
// Round-trip and version protocol
// ============================================================================

#[tokio::test]
async fn write_then_get_round_trips() {
    conformance::write_then_get_round_trips(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn insert_stores_caller_version_verbatim() {
    conformance::insert_stores_caller_version_verbatim(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn update_version_protocol() {
    conformance::update_version_protocol(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn exact_zero_version_is_persistable() {
    conformance::exact_zero_version_is_persistable(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn increment_version_counts_from_one() {
    conformance::increment_version_counts_from_one(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn increment_version_preserves_value() {
    conformance::increment_version_preserves_value(&MemoryBlobStoreFactory::new()).await;
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn get_missing_returns_not_found() {
    conformance::get_missing_returns_not_found(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn get_many_skips_missing_tks() {
    conformance::get_many_skips_missing_tks(&MemoryBlobStoreFactory::new()).await;
}

// ============================================================================
// Search
// ============================================================================

#[tokio::test]
async fn search_filters_by_type() {
    conformance::search_filters_by_type(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn search_key_prefix_overrides_keys() {
    conformance::search_key_prefix_overrides_keys(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn search_spans_networks() {
    conformance::search_spans_networks(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn search_metadata_only_omits_values() {
    conformance::search_metadata_only_omits_values(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn list_keys_returns_sorted_keys() {
    conformance::list_keys_returns_sorted_keys(&MemoryBlobStoreFactory::new()).await;
}

// ============================================================================
// Existing keys and delete
// ============================================================================

#[tokio::test]
async fn get_existing_keys_returns_present_subset() {
    conformance::get_existing_keys_returns_present_subset(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn get_existing_keys_scoped_to_network() {
    conformance::get_existing_keys_scoped_to_network(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn delete_removes_rows_and_tolerates_missing() {
    conformance::delete_removes_rows_and_tolerates_missing(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn deleted_tk_can_be_recreated() {
    conformance::deleted_tk_can_be_recreated(&MemoryBlobStoreFactory::new()).await;
}

// ============================================================================
// Transaction lifecycle
// ============================================================================

#[tokio::test]
async fn commit_visibility() {
    conformance::commit_visibility(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn rollback_isolation() {
    conformance::rollback_isolation(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn terminated_transaction_rejects_operations() {
    conformance::terminated_transaction_rejects_operations(&MemoryBlobStoreFactory::new()).await;
}

#[tokio::test]
async fn read_only_transaction_rejects_writes() {
    conformance::read_only_transaction_rejects_writes(&MemoryBlobStoreFactory::new()).await;
}

// ============================================================================
// Full suite on one shared factory
// ============================================================================

#[tokio::test]
async fn run_all_on_shared_factory() {
    conformance::run_all(&MemoryBlobStoreFactory::new()).await;
}
