//! # Indexing Engine
//!
//! Map-only incremental indexing driven by document etags. Each index owns
//! an independent storage environment rooted at its own directory (or
//! memory-only), holding:
//!
//! - `Stats`: the index type and definition text
//! - `Etags.Map`: collection → last mapped document etag
//! - `Etags.Tombstone`: collection → last processed tombstone etag
//!
//! The search index proper lives behind the `IndexPersistence` trait — an
//! opaque engine the worker feeds with `write(doc)` and `delete(key)`. The
//! engine persists alongside in its own format; this crate only owns the
//! cursors.
//!
//! A dedicated worker thread consumes the document store's change
//! notifications and advances the cursors monotonically, with no gaps.
//! `is_stale` compares the cursors against the store's feeds; staleness is
//! a query-result flag, never an error. Disposing an index cancels the
//! worker and joins it before the environment is released.

mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::info;

use crate::config::{
    DEFAULT_DOC_PROCESSING_TIMEOUT_MS, DEFAULT_INDEX_BATCH_SIZE,
    DEFAULT_TOMBSTONE_PROCESSING_TIMEOUT_MS, INDEX_ERROR_BACKOFF_MS,
};
use crate::docs::{ChangeSubscription, Document, DocumentStore};
use crate::env::{EnvOptions, StorageEnvironment};
use crate::errors::StoreError;
use crate::index::worker::{read_cursor, IndexWorker};

pub(crate) const STATS_TREE: &str = "Stats";
pub(crate) const ETAGS_MAP_TREE: &str = "Etags.Map";
pub(crate) const ETAGS_TOMBSTONE_TREE: &str = "Etags.Tombstone";

const STATS_TYPE_KEY: &[u8] = b"type";
const STATS_DEFINITION_KEY: &[u8] = b"definition";
const MAP_INDEX_TYPE: &[u8] = b"map";

/// The search engine behind an index: whatever persists the actual rows.
/// Called from the index's worker thread only.
pub trait IndexPersistence: Send + 'static {
    fn write(&mut self, doc: &Document) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
}

/// What an index is: its name, the collections it consumes, and its
/// definition text (opaque here, persisted for change detection).
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub name: String,
    pub collections: Vec<String>,
    pub definition: String,
}

#[derive(Debug, Clone)]
pub struct IndexingConfig {
    /// Documents pulled per map batch.
    pub batch_size: usize,
    /// Soft budget for one map batch; progress is committed on expiry.
    pub doc_processing_timeout: Duration,
    /// Soft budget for one cleanup batch.
    pub tombstone_processing_timeout: Duration,
    /// Pause after an unexpected batch error.
    pub error_backoff: Duration,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_INDEX_BATCH_SIZE,
            doc_processing_timeout: Duration::from_millis(DEFAULT_DOC_PROCESSING_TIMEOUT_MS),
            tombstone_processing_timeout: Duration::from_millis(
                DEFAULT_TOMBSTONE_PROCESSING_TIMEOUT_MS,
            ),
            error_backoff: Duration::from_millis(INDEX_ERROR_BACKOFF_MS),
        }
    }
}

/// A running index: its environment, its worker, and its subscription to
/// the document store's change feed.
pub struct Index {
    name: String,
    collections: Vec<String>,
    env: Arc<StorageEnvironment>,
    store: Arc<DocumentStore>,
    cancel: Arc<AtomicBool>,
    subscription: Arc<ChangeSubscription>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Index {
    /// Opens the index environment, verifies or persists its definition,
    /// and starts the worker thread.
    pub fn open(
        options: EnvOptions,
        definition: IndexDefinition,
        store: Arc<DocumentStore>,
        persistence: Box<dyn IndexPersistence>,
        config: IndexingConfig,
    ) -> Result<Arc<Self>> {
        ensure!(
            !definition.collections.is_empty(),
            StoreError::InvalidData("an index needs at least one collection".into())
        );

        let env = StorageEnvironment::open(options)?;
        persist_or_verify_stats(&env, &definition)?;

        let filter: HashSet<String> = definition.collections.iter().cloned().collect();
        let subscription = store.subscribe(Some(filter));
        let cancel = Arc::new(AtomicBool::new(false));

        let worker = IndexWorker {
            name: definition.name.clone(),
            env: Arc::clone(&env),
            store: Arc::clone(&store),
            collections: definition.collections.clone(),
            cancel: Arc::clone(&cancel),
            subscription: Arc::clone(&subscription),
            persistence,
            config,
        };
        let handle = std::thread::Builder::new()
            .name(format!("index-{}", definition.name))
            .spawn(move || worker.run())
            .map_err(StoreError::Backing)
            .wrap_err("failed to spawn index worker")?;

        info!(index = %definition.name, "index.opened");

        Ok(Arc::new(Self {
            name: definition.name,
            collections: definition.collections,
            env,
            store,
            cancel,
            subscription,
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    /// Last document etag this index has mapped for a collection.
    pub fn last_mapped_etag(&self, collection: &str) -> Result<u64> {
        read_cursor(&self.env, ETAGS_MAP_TREE, collection)
    }

    /// Last tombstone etag this index has processed for a collection.
    pub fn last_tombstone_etag(&self, collection: &str) -> Result<u64> {
        read_cursor(&self.env, ETAGS_TOMBSTONE_TREE, collection)
    }

    /// Whether the index lags the documents currently visible in the
    /// store. Reported as a flag on query results, never as an error.
    pub fn is_stale(&self) -> Result<bool> {
        for collection in &self.collections {
            if self.store.last_collection_etag(collection)?
                > self.last_mapped_etag(collection)?
            {
                return Ok(true);
            }
            if self.store.last_tombstone_etag(collection)?
                > self.last_tombstone_etag(collection)?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Cancels the worker, waits for it to exit, then releases the
    /// environment. Idempotent.
    pub fn dispose(&self) {
        self.cancel.store(true, Ordering::Release);
        self.subscription.event().set();

        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.env.dispose();
        info!(index = %self.name, "index.disposed");
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn persist_or_verify_stats(
    env: &Arc<StorageEnvironment>,
    definition: &IndexDefinition,
) -> Result<()> {
    let existing = {
        let tx = env.read_txn()?;
        match tx.open_tree(STATS_TREE)? {
            Some(stats) => {
                let kind = stats.read(&tx, STATS_TYPE_KEY)?;
                let stored = stats.read(&tx, STATS_DEFINITION_KEY)?;
                kind.zip(stored)
            }
            None => None,
        }
    };

    match existing {
        Some((kind, stored)) => {
            ensure!(
                kind == MAP_INDEX_TYPE,
                StoreError::InvalidData(format!(
                    "index '{}' was created with a different type",
                    definition.name
                ))
            );
            ensure!(
                stored == definition.definition.as_bytes(),
                StoreError::InvalidData(format!(
                    "index '{}' definition changed; reset the index directory",
                    definition.name
                ))
            );
            Ok(())
        }
        None => {
            let mut tx = env.write_txn()?;
            let mut stats = tx.open_or_create_tree(STATS_TREE)?;
            stats.add(&mut tx, STATS_TYPE_KEY, MAP_INDEX_TYPE)?;
            stats.add(
                &mut tx,
                STATS_DEFINITION_KEY,
                definition.definition.as_bytes(),
            )?;
            tx.update_tree(&stats);
            tx.commit()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::COLLECTION_METADATA_KEY;
    use hashbrown::HashMap;
    use parking_lot::Mutex as PlMutex;
    use std::time::Instant;

    /// Records every call so tests can assert on the exact feed.
    struct RecordingPersistence {
        log: Arc<PlMutex<Vec<String>>>,
    }

    impl IndexPersistence for RecordingPersistence {
        fn write(&mut self, doc: &Document) -> Result<()> {
            self.log.lock().push(format!("write:{}", doc.key));
            Ok(())
        }

        fn delete(&mut self, key: &str) -> Result<()> {
            self.log.lock().push(format!("delete:{}", key));
            Ok(())
        }
    }

    fn metadata(collection: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(COLLECTION_METADATA_KEY.to_string(), collection.to_string());
        map
    }

    fn open_index(
        store: &Arc<DocumentStore>,
        collections: &[&str],
    ) -> (Arc<Index>, Arc<PlMutex<Vec<String>>>) {
        let log = Arc::new(PlMutex::new(Vec::new()));
        let index = Index::open(
            EnvOptions::memory(),
            IndexDefinition {
                name: "by-name".into(),
                collections: collections.iter().map(|c| c.to_string()).collect(),
                definition: "from doc in docs select new { doc.Name }".into(),
            },
            Arc::clone(store),
            Box::new(RecordingPersistence {
                log: Arc::clone(&log),
            }),
            IndexingConfig::default(),
        )
        .unwrap();
        (index, log)
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn index_catches_up_and_becomes_fresh() {
        let store = DocumentStore::open(EnvOptions::memory()).unwrap();
        store.put("users/1", None, b"{}", &metadata("Users")).unwrap();
        store.put("users/2", None, b"{}", &metadata("Users")).unwrap();

        let (index, log) = open_index(&store, &["Users"]);

        assert!(wait_until(2_000, || {
            index.last_mapped_etag("Users").unwrap() == store.last_etag()
        }));
        assert!(!index.is_stale().unwrap());
        assert_eq!(
            *log.lock(),
            vec!["write:users/1".to_string(), "write:users/2".to_string()]
        );
    }

    #[test]
    fn index_ignores_other_collections() {
        let store = DocumentStore::open(EnvOptions::memory()).unwrap();
        let (index, log) = open_index(&store, &["Users"]);

        store.put("pets/1", None, b"{}", &metadata("Dogs")).unwrap();
        store.put("users/1", None, b"{}", &metadata("Users")).unwrap();

        assert!(wait_until(2_000, || {
            log.lock().iter().any(|e| e == "write:users/1")
        }));
        assert!(!log.lock().iter().any(|entry| entry.contains("pets")));
        assert!(!index.is_stale().unwrap());
    }

    #[test]
    fn deleting_an_indexed_document_reaches_persistence_once() {
        let store = DocumentStore::open(EnvOptions::memory()).unwrap();
        store.put("users/1", None, b"{}", &metadata("Users")).unwrap();

        let (index, log) = open_index(&store, &["Users"]);
        assert!(wait_until(2_000, || index.last_mapped_etag("Users").unwrap() > 0));

        store.delete("users/1", None).unwrap();

        assert!(wait_until(2_000, || {
            log.lock().iter().any(|e| e == "delete:users/1")
        }));
        assert!(wait_until(2_000, || !index.is_stale().unwrap()));
        let deletes = log
            .lock()
            .iter()
            .filter(|e| e.as_str() == "delete:users/1")
            .count();
        assert_eq!(deletes, 1);
    }

    #[test]
    fn tombstones_for_never_mapped_documents_are_skipped() {
        let store = DocumentStore::open(EnvOptions::memory()).unwrap();
        // Put and delete before the index ever runs: the tombstone's
        // deleted_etag is above any mapped etag.
        store.put("users/1", None, b"{}", &metadata("Users")).unwrap();
        store.delete("users/1", None).unwrap();

        let (index, log) = open_index(&store, &["Users"]);

        assert!(wait_until(2_000, || {
            index.last_tombstone_etag("Users").unwrap() == 2
        }));
        assert!(!log.lock().iter().any(|e| e.starts_with("delete:")));
        assert!(!index.is_stale().unwrap());
        drop(index);
    }

    #[test]
    fn dispose_stops_the_worker_promptly() {
        let store = DocumentStore::open(EnvOptions::memory()).unwrap();
        let (index, _log) = open_index(&store, &["Users"]);

        let started = Instant::now();
        index.dispose();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(index.env.is_disposed());
    }

    #[test]
    fn definition_change_is_rejected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.vlm");
        let store = DocumentStore::open(EnvOptions::memory()).unwrap();

        let make = |definition: &str| {
            Index::open(
                EnvOptions::file(&path),
                IndexDefinition {
                    name: "idx".into(),
                    collections: vec!["Users".into()],
                    definition: definition.into(),
                },
                Arc::clone(&store),
                Box::new(RecordingPersistence {
                    log: Arc::new(PlMutex::new(Vec::new())),
                }),
                IndexingConfig::default(),
            )
        };

        let first = make("v1").unwrap();
        first.dispose();
        drop(first);

        assert!(make("v2").is_err());
    }
}
