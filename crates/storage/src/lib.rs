//! Versioned, transactional, tenant-partitioned blob storage.
//!
//! This crate is the persistence core shared by every gridstore service:
//! a key-value store of small opaque records ([`Blob`]s), partitioned by
//! tenant ("network"), versioned with an optimistic counter, and accessed
//! through short-lived transactions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Domain services                          │
//! │   health │ certifier │ directory │ device │ probe state     │
//! │        (marshal domain structs to/from blob values)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      gridstore                              │
//! │          BlobStoreFactory / BlobStore traits                │
//! │   (get, get_many, search, write, increment_version, ...)    │
//! ├───────────────────┬──────────────────┬──────────────────────┤
//! │ MemoryBlobStore   │  gridstore-sql   │    gridstore-orm     │
//! │ (tests, dev)      │  (hand-built SQL)│  (ORM parity engine) │
//! └───────────────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! All backends read and write the same logical row layout, so a
//! deployment can switch backends without a data migration; the
//! [`conformance`] suite and the parity tests in `gridstore-orm` hold them
//! to it.
//!
//! # Quick Start
//!
//! ```
//! use gridstore::{
//!     Blob, BlobStoreFactory, MemoryBlobStoreFactory, TransactionOptions, TypeAndKey,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = MemoryBlobStoreFactory::new();
//!
//!     // All access happens inside a transaction.
//!     let mut store = factory.start_transaction(TransactionOptions::default()).await?;
//!     store.create_or_update("network-1", vec![Blob::new("probe_state", "probe-7", b"state".as_slice())]).await?;
//!     store.commit().await?;
//!
//!     let mut store = factory.start_transaction(TransactionOptions::read_only()).await?;
//!     let blob = store.get("network-1", &TypeAndKey::new("probe_state", "probe-7")).await?;
//!     assert_eq!(blob.version, 0);
//!     store.rollback().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Implementing a Backend
//!
//! 1. Implement [`BlobStoreFactory`] and a [`BlobStore`] transaction handle
//! 2. Route every version computation through [`WriteVersion::resolve`]
//! 3. Map backend-specific errors to [`StorageError`]
//! 4. Run the [`conformance`] suite from your crate's `tests/` directory
//!
//! See the [`memory`] module source for a reference implementation.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the [`testutil`] helpers and the [`conformance`] suite. Enable this
//!   from `[dev-dependencies]` in backend crates.

#![deny(unsafe_code)]

#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod conformance;
pub mod error;
pub mod filter;
pub mod memory;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

// Re-export primary types at crate root for convenience
pub use error::{BoxError, StorageError, StorageResult};
pub use filter::{KeyPredicate, LoadCriteria, SearchFilter, prefix_bounds};
pub use memory::MemoryBlobStoreFactory;
pub use store::{
    BlobStore, BlobStoreFactory, Isolation, PLACEHOLDER_NETWORK_ID, TransactionOptions,
    TransactionState,
};
pub use types::{Blob, BlobWrite, TypeAndKey, WriteVersion};
