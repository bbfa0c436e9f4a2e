//! # Document Store
//!
//! Collection-scoped document storage over the tree layer. Three logical
//! indexes back every document, all trees in one environment:
//!
//! - `docs`: case-folded key → document record (original casing inside)
//! - `etags`: big-endian etag → folded key (the global change feed)
//! - `collections/<name>`: big-endian etag → folded key (per-collection feed)
//!
//! Deletions append to `tombstones/<name>` (big-endian etag → tombstone
//! record) so incremental consumers observe them by etag range;
//! `tombstones.index` (folded key · NUL · collection → etag) lets a re-put
//! retire the tombstone of its own collection, keeping a key in exactly one
//! of {live, tombstoned} per collection.
//!
//! ## Etags
//!
//! One global 64-bit counter, incremented per put or delete, persisted with
//! the commit. The per-collection order is the projection of the global
//! order. Keys compare case-insensitively (ASCII ordinal); the stored
//! casing comes back on read.
//!
//! ## Change Notifications
//!
//! Each batch collects its changes and delivers them to subscribers after
//! commit publication, in commit order. A subscription carries a collection
//! filter and a manual-reset event; index workers park on it.

mod notifications;
mod record;

pub use notifications::{ChangeEvent, ChangeKind, ChangeSubscription, DocumentChange};
pub use record::{decode_document, decode_tombstone, encode_document, encode_tombstone};

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::debug;

use crate::env::{EnvOptions, StorageEnvironment};
use crate::errors::StoreError;
use crate::tree::Tree;
use crate::txn::{ReadTransaction, WriteTransaction};

/// Metadata key naming a document's collection.
pub const COLLECTION_METADATA_KEY: &str = "Raven-Entity-Name";

/// Collection of documents whose metadata names none.
pub const DEFAULT_COLLECTION: &str = "@default";

const DOCS_TREE: &str = "docs";
const ETAGS_TREE: &str = "etags";
const TOMBSTONE_INDEX_TREE: &str = "tombstones.index";

fn collection_etags_tree(collection: &str) -> String {
    format!("collections/{}", collection)
}

fn tombstones_tree(collection: &str) -> String {
    format!("tombstones/{}", collection)
}

/// Case-insensitive (ASCII ordinal) identity of a document key.
fn fold_key(key: &str) -> Vec<u8> {
    key.bytes().map(|b| b.to_ascii_lowercase()).collect()
}

fn etag_key(etag: u64) -> [u8; 8] {
    etag.to_be_bytes()
}

fn tombstone_index_key(folded: &[u8], collection: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(folded.len() + 1 + collection.len());
    key.extend_from_slice(folded);
    key.push(0);
    key.extend_from_slice(collection.as_bytes());
    key
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The self-describing binary document body is opaque to the store; all it
/// needs is a metadata accessor to find the collection name.
pub trait MetadataView {
    fn try_get(&self, name: &str) -> Option<&str>;
}

impl MetadataView for HashMap<String, String> {
    fn try_get(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// No metadata at all; every document lands in the default collection.
impl MetadataView for () {
    fn try_get(&self, _name: &str) -> Option<&str> {
        None
    }
}

/// A materialized document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: String,
    pub etag: u64,
    pub collection: String,
    pub last_modified: u64,
    pub data: Vec<u8>,
}

/// A materialized tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub key: String,
    pub etag: u64,
    pub deleted_etag: u64,
    pub collection: String,
}

pub struct DocumentStore {
    env: Arc<StorageEnvironment>,
    subscriptions: Mutex<Vec<Weak<ChangeSubscription>>>,
}

impl DocumentStore {
    pub fn open(options: EnvOptions) -> Result<Arc<Self>> {
        let env = StorageEnvironment::open(options)?;
        Ok(Arc::new(Self {
            env,
            subscriptions: Mutex::new(Vec::new()),
        }))
    }

    pub fn env(&self) -> &Arc<StorageEnvironment> {
        &self.env
    }

    /// Opens a multi-operation write batch backed by the single write
    /// transaction.
    pub fn batch(&self) -> Result<DocumentBatch<'_>> {
        Ok(DocumentBatch {
            store: self,
            tx: self.env.write_txn()?,
            trees: HashMap::new(),
            changes: Vec::new(),
        })
    }

    /// Single-document put in its own transaction. Returns the new etag.
    pub fn put(
        &self,
        key: &str,
        expected_etag: Option<u64>,
        body: &[u8],
        metadata: &impl MetadataView,
    ) -> Result<u64> {
        let mut batch = self.batch()?;
        let etag = batch.put(key, expected_etag, body, metadata)?;
        batch.commit()?;
        Ok(etag)
    }

    /// Single-document delete in its own transaction. Returns the tombstone
    /// etag, or `None` when the key did not exist.
    pub fn delete(&self, key: &str, expected_etag: Option<u64>) -> Result<Option<u64>> {
        let mut batch = self.batch()?;
        let etag = batch.delete(key, expected_etag)?;
        batch.commit()?;
        Ok(etag)
    }

    /// Direct lookup; the stored (original) key casing comes back.
    pub fn get(&self, key: &str) -> Result<Option<Document>> {
        let tx = self.env.read_txn()?;
        let Some(docs) = tx.open_tree(DOCS_TREE)? else {
            return Ok(None);
        };

        match docs.read(&tx, &fold_key(key))? {
            Some(bytes) => Ok(Some(materialize_document(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Documents with etag strictly greater than `after`, in etag order.
    /// `collection = None` scans the global feed.
    pub fn documents_after(
        &self,
        collection: Option<&str>,
        after: u64,
        take: usize,
    ) -> Result<Vec<Document>> {
        let tx = self.env.read_txn()?;

        let tree_name = match collection {
            Some(name) => collection_etags_tree(name),
            None => ETAGS_TREE.to_string(),
        };
        let (Some(feed), Some(docs)) = (tx.open_tree(&tree_name)?, tx.open_tree(DOCS_TREE)?)
        else {
            return Ok(Vec::new());
        };

        let mut result = Vec::new();
        let mut iter = feed.iter(&tx);
        iter.seek(&etag_key(after.saturating_add(1)))?;
        while result.len() < take {
            let Some((_, folded)) = iter.next()? else {
                break;
            };
            // Feed entries are removed together with their documents, so a
            // miss here means corruption rather than staleness; skip it but
            // leave a trace.
            match docs.read(&tx, &folded)? {
                Some(bytes) => result.push(materialize_document(&bytes)?),
                None => debug!(
                    key = %String::from_utf8_lossy(&folded),
                    "docs.feed_entry_without_document"
                ),
            }
        }
        Ok(result)
    }

    /// Tombstones of a collection with etag strictly greater than `after`.
    pub fn tombstones_after(
        &self,
        collection: &str,
        after: u64,
        take: usize,
    ) -> Result<Vec<Tombstone>> {
        let tx = self.env.read_txn()?;
        let Some(tree) = tx.open_tree(&tombstones_tree(collection))? else {
            return Ok(Vec::new());
        };

        let mut result = Vec::new();
        let mut iter = tree.iter(&tx);
        iter.seek(&etag_key(after.saturating_add(1)))?;
        while result.len() < take {
            let Some((_, bytes)) = iter.next()? else {
                break;
            };
            let view = decode_tombstone(&bytes)?;
            result.push(Tombstone {
                key: view.key.to_string(),
                etag: view.etag,
                deleted_etag: view.deleted_etag,
                collection: view.collection.to_string(),
            });
        }
        Ok(result)
    }

    /// Last assigned etag, across all collections.
    pub fn last_etag(&self) -> u64 {
        self.env.committed_state().global_etag
    }

    /// Greatest document etag in a collection's feed, 0 when empty.
    pub fn last_collection_etag(&self, collection: &str) -> Result<u64> {
        let tx = self.env.read_txn()?;
        last_be_key(&tx, &collection_etags_tree(collection))
    }

    /// Greatest tombstone etag in a collection, 0 when none.
    pub fn last_tombstone_etag(&self, collection: &str) -> Result<u64> {
        let tx = self.env.read_txn()?;
        last_be_key(&tx, &tombstones_tree(collection))
    }

    /// Registers a change listener. `collections = None` hears everything.
    pub fn subscribe(&self, collections: Option<HashSet<String>>) -> Arc<ChangeSubscription> {
        let subscription = Arc::new(ChangeSubscription::new(collections));
        self.subscriptions
            .lock()
            .push(Arc::downgrade(&subscription));
        subscription
    }

    fn notify(&self, changes: &[DocumentChange]) {
        if changes.is_empty() {
            return;
        }

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|weak| {
            let Some(subscription) = weak.upgrade() else {
                return false;
            };
            if changes
                .iter()
                .any(|change| subscription.matches(&change.collection))
            {
                subscription.event().set();
            }
            true
        });
    }
}

fn materialize_document(record: &[u8]) -> Result<Document> {
    let view = decode_document(record)?;
    Ok(Document {
        key: view.key.to_string(),
        etag: view.etag,
        collection: view.collection.to_string(),
        last_modified: view.last_modified,
        data: view.body.to_vec(),
    })
}

fn last_be_key(tx: &ReadTransaction, tree_name: &str) -> Result<u64> {
    let Some(tree) = tx.open_tree(tree_name)? else {
        return Ok(0);
    };
    match tree.last_key(tx)? {
        Some(key) if key.len() == 8 => Ok(u64::from_be_bytes(key[..8].try_into().unwrap())),
        Some(_) => Err(StoreError::Corrupt(format!(
            "feed tree {} holds a non-etag key",
            tree_name
        ))
        .into()),
        None => Ok(0),
    }
}

/// A write batch: any number of puts and deletes under one transaction,
/// with change notifications delivered after the commit publishes.
pub struct DocumentBatch<'a> {
    store: &'a DocumentStore,
    tx: WriteTransaction<'a>,
    trees: HashMap<String, Tree>,
    changes: Vec<DocumentChange>,
}

impl DocumentBatch<'_> {
    fn take_tree(&mut self, name: &str) -> Result<Tree> {
        match self.trees.remove(name) {
            Some(tree) => Ok(tree),
            None => self.tx.open_or_create_tree(name),
        }
    }

    fn put_back(&mut self, tree: Tree) {
        self.trees.insert(tree.name().to_string(), tree);
    }

    /// Inserts or replaces a document. `expected_etag` semantics:
    /// `None` is unconditional, `Some(0)` demands the key not exist,
    /// `Some(e)` demands the current etag equal `e`.
    pub fn put(
        &mut self,
        key: &str,
        expected_etag: Option<u64>,
        body: &[u8],
        metadata: &impl MetadataView,
    ) -> Result<u64> {
        ensure!(
            !key.is_empty(),
            StoreError::InvalidData("document key must not be empty".into())
        );

        let folded = fold_key(key);
        let mut docs = self.take_tree(DOCS_TREE)?;

        let old = match docs.read(&self.tx, &folded)? {
            Some(bytes) => {
                let view = decode_document(&bytes)?;
                Some((view.etag, view.collection.to_string()))
            }
            None => None,
        };

        check_expected_etag(expected_etag, old.as_ref().map(|(etag, _)| *etag))?;

        let etag = self.tx.next_etag();
        let collection = metadata
            .try_get(COLLECTION_METADATA_KEY)
            .unwrap_or(DEFAULT_COLLECTION)
            .to_string();

        if let Some((old_etag, old_collection)) = &old {
            let mut etags = self.take_tree(ETAGS_TREE)?;
            etags.delete(&mut self.tx, &etag_key(*old_etag))?;
            self.put_back(etags);

            let mut feed = self.take_tree(&collection_etags_tree(old_collection))?;
            feed.delete(&mut self.tx, &etag_key(*old_etag))?;
            self.put_back(feed);

            if *old_collection != collection {
                // The document moved between collections: indexers bound to
                // the old one must see a delete.
                let mut tombs = self.take_tree(&tombstones_tree(old_collection))?;
                tombs.add(
                    &mut self.tx,
                    &etag_key(etag),
                    &encode_tombstone(etag, *old_etag, key, old_collection),
                )?;
                self.put_back(tombs);

                let mut index = self.take_tree(TOMBSTONE_INDEX_TREE)?;
                index.add(
                    &mut self.tx,
                    &tombstone_index_key(&folded, old_collection),
                    &etag.to_le_bytes(),
                )?;
                self.put_back(index);

                self.changes.push(DocumentChange {
                    key: key.to_string(),
                    collection: old_collection.clone(),
                    etag,
                    kind: ChangeKind::Delete,
                });
            }
        }

        // The key is live in this collection again: retire its tombstone.
        let mut index = self.take_tree(TOMBSTONE_INDEX_TREE)?;
        let index_key = tombstone_index_key(&folded, &collection);
        if let Some(bytes) = index.read(&self.tx, &index_key)? {
            ensure!(
                bytes.len() == 8,
                StoreError::Corrupt("malformed tombstone index entry".into())
            );
            let tombstone_etag = u64::from_le_bytes(bytes[..8].try_into().unwrap());

            let mut tombs = self.take_tree(&tombstones_tree(&collection))?;
            tombs.delete(&mut self.tx, &etag_key(tombstone_etag))?;
            self.put_back(tombs);
            index.delete(&mut self.tx, &index_key)?;
        }
        self.put_back(index);

        docs.add(
            &mut self.tx,
            &folded,
            &encode_document(etag, unix_millis(), key, &collection, body),
        )?;
        self.put_back(docs);

        let mut etags = self.take_tree(ETAGS_TREE)?;
        etags.add(&mut self.tx, &etag_key(etag), &folded)?;
        self.put_back(etags);

        let mut feed = self.take_tree(&collection_etags_tree(&collection))?;
        feed.add(&mut self.tx, &etag_key(etag), &folded)?;
        self.put_back(feed);

        self.changes.push(DocumentChange {
            key: key.to_string(),
            collection,
            etag,
            kind: ChangeKind::Put,
        });
        Ok(etag)
    }

    /// Deletes a document, appending a tombstone to its collection.
    pub fn delete(&mut self, key: &str, expected_etag: Option<u64>) -> Result<Option<u64>> {
        let folded = fold_key(key);
        let mut docs = self.take_tree(DOCS_TREE)?;

        let old = match docs.read(&self.tx, &folded)? {
            Some(bytes) => {
                let view = decode_document(&bytes)?;
                Some((view.etag, view.key.to_string(), view.collection.to_string()))
            }
            None => None,
        };

        check_expected_etag(expected_etag, old.as_ref().map(|(etag, _, _)| *etag))?;

        let Some((old_etag, stored_key, collection)) = old else {
            self.put_back(docs);
            return Ok(None);
        };

        let etag = self.tx.next_etag();

        docs.delete(&mut self.tx, &folded)?;
        self.put_back(docs);

        let mut etags = self.take_tree(ETAGS_TREE)?;
        etags.delete(&mut self.tx, &etag_key(old_etag))?;
        self.put_back(etags);

        let mut feed = self.take_tree(&collection_etags_tree(&collection))?;
        feed.delete(&mut self.tx, &etag_key(old_etag))?;
        self.put_back(feed);

        let mut tombs = self.take_tree(&tombstones_tree(&collection))?;
        tombs.add(
            &mut self.tx,
            &etag_key(etag),
            &encode_tombstone(etag, old_etag, &stored_key, &collection),
        )?;
        self.put_back(tombs);

        let mut index = self.take_tree(TOMBSTONE_INDEX_TREE)?;
        index.add(
            &mut self.tx,
            &tombstone_index_key(&folded, &collection),
            &etag.to_le_bytes(),
        )?;
        self.put_back(index);

        self.changes.push(DocumentChange {
            key: stored_key,
            collection,
            etag,
            kind: ChangeKind::Delete,
        });
        Ok(Some(etag))
    }

    /// Reads through this batch's own uncommitted writes.
    pub fn get(&mut self, key: &str) -> Result<Option<Document>> {
        let docs = self.take_tree(DOCS_TREE)?;
        let result = match docs.read(&self.tx, &fold_key(key))? {
            Some(bytes) => Some(materialize_document(&bytes)?),
            None => None,
        };
        self.put_back(docs);
        Ok(result)
    }

    /// Commits and then delivers this batch's change notifications.
    pub fn commit(self) -> Result<()> {
        let DocumentBatch {
            store,
            mut tx,
            trees,
            changes,
        } = self;

        for tree in trees.values() {
            tx.update_tree(tree);
        }
        tx.commit().wrap_err("document batch commit failed")?;

        store.notify(&changes);
        Ok(())
    }

    pub fn rollback(self) {
        self.tx.rollback();
    }
}

fn check_expected_etag(expected: Option<u64>, actual: Option<u64>) -> Result<()> {
    let conflict = match expected {
        None => false,
        Some(0) => actual.is_some(),
        Some(e) => actual != Some(e),
    };
    ensure!(
        !conflict,
        StoreError::ConcurrencyConflict { expected, actual }
    );
    Ok(())
}
