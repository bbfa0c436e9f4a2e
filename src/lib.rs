//! # Vellum — Transactional Page Store for a Document Database
//!
//! Vellum is the storage core of a document database server: an embedded,
//! single-file, memory-mapped page store with copy-on-write B+-trees,
//! MVCC-style single-writer transactions, a bitmap free-space manager, a
//! collection-scoped document store, and a background indexing loop driven
//! by document etags.
//!
//! ## Quick Start
//!
//! ```ignore
//! use vellum::{DocumentStore, EnvOptions};
//!
//! let store = DocumentStore::open(EnvOptions::file("./db/main.vlm"))?;
//!
//! let etag = store.put("users/1", None, body, &metadata)?;
//! let doc = store.get("users/1")?.unwrap();
//! let feed = store.documents_after(Some("Users"), 0, 128)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Indexing Engine (per-index env + loop) │
//! ├──────────────────────────────────────────┤
//! │   Document Store (etags, tombstones)     │
//! ├──────────────────────────────────────────┤
//! │   Trees (slotted B+-tree, overflow)      │
//! ├────────────────────┬─────────────────────┤
//! │   Transactions     │   Free-Space Bitmap │
//! ├────────────────────┴─────────────────────┤
//! │   Pager (mmap / heap, COW snapshots)     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! One writer, many readers: readers pin a committed snapshot and an
//! `Arc`-counted mapping handle; the writer copies pages before touching
//! them and publishes atomically through double-buffered, checksummed
//! header pages. Freed pages return to circulation only once every reader
//! that could see them is gone.
//!
//! ## Module Overview
//!
//! - [`storage`]: pager, page headers, store headers
//! - [`freespace`]: bitmap-sectioned free page tracking
//! - [`txn`]: read/write transactions, COW, reader registry
//! - [`env`]: the storage environment and its options
//! - [`tree`]: B+-trees with overflow and multi-value support
//! - [`docs`]: documents, collections, etag feeds, tombstones
//! - [`index`]: per-index environments and the map/cleanup worker

pub mod config;
pub mod docs;
pub mod encoding;
pub mod env;
pub mod errors;
pub mod freespace;
pub mod index;
pub mod storage;
pub mod tree;
pub mod txn;

pub use docs::{
    ChangeKind, ChangeSubscription, Document, DocumentBatch, DocumentChange, DocumentStore,
    MetadataView, Tombstone, COLLECTION_METADATA_KEY, DEFAULT_COLLECTION,
};
pub use env::{CommittedState, EnvOptions, StorageEnvironment};
pub use errors::{store_error, StoreError};
pub use index::{Index, IndexDefinition, IndexPersistence, IndexingConfig};
pub use tree::{Tree, TreeIterator, TreeState};
pub use txn::{PageRead, ReadTransaction, WriteTransaction};
