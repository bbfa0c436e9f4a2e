//! # Index Worker Loop
//!
//! One long-lived thread per index. Each pass resets the change event, runs
//! tombstone cleanup and then the map step for every subscribed collection,
//! and parks on the event. A set that arrives mid-pass is not lost: the
//! event is manual-reset, so the next wait returns immediately.
//!
//! Cursors advance transactionally in the index's own environment: the map
//! cursor only moves after the documents up to it were offered to the
//! persistence layer, so a crash replays at-least-once from the last commit
//! and never skips an etag.
//!
//! Per-document failures are logged and skipped; batch-level failures roll
//! the cursor transaction back and back the worker off briefly before the
//! next pass. Cancellation is checked at every yielded item.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use eyre::Result;
use tracing::{debug, warn};

use crate::docs::{ChangeSubscription, DocumentStore};
use crate::env::StorageEnvironment;
use crate::index::{IndexPersistence, IndexingConfig, ETAGS_MAP_TREE, ETAGS_TOMBSTONE_TREE};

pub(crate) struct IndexWorker {
    pub name: String,
    pub env: Arc<StorageEnvironment>,
    pub store: Arc<DocumentStore>,
    pub collections: Vec<String>,
    pub cancel: Arc<AtomicBool>,
    pub subscription: Arc<ChangeSubscription>,
    pub persistence: Box<dyn IndexPersistence>,
    pub config: IndexingConfig,
}

impl IndexWorker {
    pub fn run(mut self) {
        debug!(index = %self.name, "index.worker_started");

        let collections = self.collections.clone();
        while !self.cancelled() {
            self.subscription.event().reset();

            let mut more_work = false;
            let mut errored = false;

            for collection in &collections {
                if self.cancelled() {
                    break;
                }
                match self.execute_cleanup(collection) {
                    Ok(more) => more_work |= more,
                    Err(err) => {
                        warn!(index = %self.name, collection = %collection, %err, "index.cleanup_failed");
                        errored = true;
                    }
                }
                match self.execute_map(collection) {
                    Ok(more) => more_work |= more,
                    Err(err) => {
                        warn!(index = %self.name, collection = %collection, %err, "index.map_failed");
                        errored = true;
                    }
                }
            }

            if self.cancelled() {
                break;
            }
            if errored {
                // No cursor moved for the failed batch; retry after a
                // breather. A finer policy is a TODO once real failure
                // modes show up.
                std::thread::sleep(self.config.error_backoff);
                continue;
            }
            if more_work {
                self.subscription.event().set();
            }

            self.subscription.event().wait();
        }

        debug!(index = %self.name, "index.worker_stopped");
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Maps documents committed after the collection's cursor. Returns
    /// whether more work is likely pending.
    fn execute_map(&mut self, collection: &str) -> Result<bool> {
        let last_mapped = self.read_cursor(ETAGS_MAP_TREE, collection)?;
        let batch = self
            .store
            .documents_after(Some(collection), last_mapped, self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(false);
        }

        let started = Instant::now();
        let mut cursor = last_mapped;
        let mut processed = 0usize;
        let mut stopped_early = false;

        for doc in &batch {
            if self.cancelled() {
                stopped_early = true;
                break;
            }
            if let Err(err) = self.persistence.write(doc) {
                warn!(index = %self.name, key = %doc.key, %err, "index.map.document_failed");
            }
            cursor = doc.etag;
            processed += 1;
            if started.elapsed() >= self.config.doc_processing_timeout {
                stopped_early = true;
                break;
            }
        }

        if processed > 0 {
            self.write_cursor(ETAGS_MAP_TREE, collection, cursor)?;
            debug!(
                index = %self.name,
                collection = %collection,
                processed,
                cursor,
                "index.map"
            );
        }

        Ok(stopped_early || batch.len() == self.config.batch_size)
    }

    /// Processes tombstones committed after the collection's tombstone
    /// cursor, deleting rows the index ever mapped.
    fn execute_cleanup(&mut self, collection: &str) -> Result<bool> {
        let last_tombstone = self.read_cursor(ETAGS_TOMBSTONE_TREE, collection)?;
        let last_mapped = self.read_cursor(ETAGS_MAP_TREE, collection)?;

        let batch = self
            .store
            .tombstones_after(collection, last_tombstone, self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(false);
        }

        let started = Instant::now();
        let mut cursor = last_tombstone;
        let mut processed = 0usize;
        let mut stopped_early = false;

        for tombstone in &batch {
            if self.cancelled() {
                stopped_early = true;
                break;
            }
            // A document deleted before we ever mapped it left no row
            // behind; only deletions at or below the map cursor did.
            if tombstone.deleted_etag <= last_mapped {
                if let Err(err) = self.persistence.delete(&tombstone.key) {
                    warn!(
                        index = %self.name,
                        key = %tombstone.key,
                        %err,
                        "index.cleanup.delete_failed"
                    );
                }
            }
            cursor = tombstone.etag;
            processed += 1;
            if started.elapsed() >= self.config.tombstone_processing_timeout {
                stopped_early = true;
                break;
            }
        }

        if processed > 0 {
            self.write_cursor(ETAGS_TOMBSTONE_TREE, collection, cursor)?;
            debug!(
                index = %self.name,
                collection = %collection,
                processed,
                cursor,
                "index.cleanup"
            );
        }

        Ok(stopped_early || batch.len() == self.config.batch_size)
    }

    fn read_cursor(&self, tree_name: &str, collection: &str) -> Result<u64> {
        read_cursor(&self.env, tree_name, collection)
    }

    fn write_cursor(&self, tree_name: &str, collection: &str, value: u64) -> Result<()> {
        let mut tx = self.env.write_txn()?;
        let mut tree = tx.open_or_create_tree(tree_name)?;
        tree.add(&mut tx, collection.as_bytes(), &value.to_le_bytes())?;
        tx.update_tree(&tree);
        tx.commit()
    }
}

/// Reads a collection cursor out of an index environment; 0 when unset.
pub(crate) fn read_cursor(
    env: &Arc<StorageEnvironment>,
    tree_name: &str,
    collection: &str,
) -> Result<u64> {
    let tx = env.read_txn()?;
    let Some(tree) = tx.open_tree(tree_name)? else {
        return Ok(0);
    };
    match tree.read(&tx, collection.as_bytes())? {
        Some(bytes) if bytes.len() == 8 => Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap())),
        Some(_) => Err(crate::errors::StoreError::Corrupt(format!(
            "cursor for collection '{}' in tree '{}' is malformed",
            collection, tree_name
        ))
        .into()),
        None => Ok(0),
    }
}
