//! # Storage Environment
//!
//! A `StorageEnvironment` owns one page store: the pager, the free-space
//! manager, the reader registry, the writer slot, and the in-memory copy of
//! the last committed state. It is the unit of recovery — on open it loads
//! the newest verified header and refuses to proceed if the root tree it
//! points at is unreadable.
//!
//! ## Single-Writer Discipline
//!
//! The writer slot is a mutex: `write_txn` blocks until it is free,
//! `try_write_txn` fails fast with `Concurrent`. Readers never take it;
//! they snapshot the committed state under a short lock and hold an
//! `Arc<PagerState>` so remaps cannot pull the mapping out from under them.
//!
//! ## Commit Publication
//!
//! Commit order is: data sync, inactive header slot write, header sync,
//! in-memory publish, pending-free bookkeeping. A transaction opened after
//! commit returns is guaranteed to observe it; a crash before the header
//! sync leaves the previous header the newest verified one.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info};
use zerocopy::IntoBytes;

use crate::config::{
    CURRENT_SCHEMA_VERSION, HEADER_PAGE_COUNT, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::errors::StoreError;
use crate::freespace::FreeSpace;
use crate::storage::{select_header, Pager, StoreHeader, validate_page};
use crate::tree::TreeState;
use crate::txn::{ReadTransaction, ReaderRegistry, WriteTransaction};

/// Options fixed at environment creation.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Backing file; `None` keeps the whole store on the heap.
    pub path: Option<PathBuf>,
    /// Page size in bytes, 4096 or 8192. Immutable once the store exists.
    pub page_size: u32,
    /// On-disk schema version the caller expects.
    pub schema_version: u32,
    /// Lower bound for one growth step, in bytes.
    pub min_increase_size: Option<u64>,
    /// Upper bound for one growth step, in bytes.
    pub max_increase_size: Option<u64>,
}

impl EnvOptions {
    pub fn memory() -> Self {
        Self {
            path: None,
            page_size: crate::config::DEFAULT_PAGE_SIZE,
            schema_version: CURRENT_SCHEMA_VERSION,
            min_increase_size: None,
            max_increase_size: None,
        }
    }

    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::memory()
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self::memory()
    }
}

/// The last committed, published state of the store.
#[derive(Debug, Clone, Copy)]
pub struct CommittedState {
    pub root: TreeState,
    pub next_page: u64,
    pub global_etag: u64,
    pub last_txn_id: u64,
    pub generation: u64,
}

pub struct StorageEnvironment {
    pub(crate) pager: Pager,
    pub(crate) committed: Mutex<CommittedState>,
    pub(crate) writer: Mutex<()>,
    pub(crate) readers: ReaderRegistry,
    pub(crate) freespace: Mutex<FreeSpace>,
}

impl StorageEnvironment {
    pub fn open(options: EnvOptions) -> Result<Arc<Self>> {
        ensure!(
            options.page_size == MIN_PAGE_SIZE || options.page_size == MAX_PAGE_SIZE,
            StoreError::InvalidData(format!(
                "unsupported page size {} (expected {} or {})",
                options.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            ))
        );
        ensure!(
            options.schema_version == CURRENT_SCHEMA_VERSION,
            StoreError::InvalidData(format!(
                "unsupported schema version {} (current {})",
                options.schema_version, CURRENT_SCHEMA_VERSION
            ))
        );

        let (pager, fresh) = match &options.path {
            None => (
                Pager::memory(
                    options.page_size,
                    options.min_increase_size,
                    options.max_increase_size,
                )?,
                true,
            ),
            Some(path) => {
                let (pager, created) = Pager::file(
                    path,
                    options.page_size,
                    options.min_increase_size,
                    options.max_increase_size,
                )?;
                (pager, created)
            }
        };

        let committed = if fresh {
            bootstrap(&pager, options.page_size)?
        } else {
            recover(&pager, options.page_size)?
        };

        info!(
            page_size = options.page_size,
            next_page = committed.next_page,
            generation = committed.generation,
            fresh,
            "env.open"
        );

        Ok(Arc::new(Self {
            pager,
            committed: Mutex::new(committed),
            writer: Mutex::new(()),
            readers: ReaderRegistry::new(),
            freespace: Mutex::new(FreeSpace::new()),
        }))
    }

    pub fn page_size(&self) -> u32 {
        self.pager.page_size()
    }

    pub fn num_allocated_pages(&self) -> u64 {
        self.pager.num_allocated_pages()
    }

    /// Copy of the currently published commit point.
    pub fn committed_state(&self) -> CommittedState {
        *self.committed.lock()
    }

    /// Opens a read transaction against the current committed snapshot.
    pub fn read_txn(self: &Arc<Self>) -> Result<ReadTransaction> {
        ensure!(!self.pager.is_disposed(), StoreError::Disposed);

        // Registering under the committed lock closes the race with a
        // committing writer's pending-free drain.
        let snapshot = {
            let committed = self.committed.lock();
            self.readers.register(committed.last_txn_id);
            *committed
        };
        let state = self.pager.state();

        Ok(ReadTransaction::new(Arc::clone(self), snapshot, state))
    }

    /// Opens the single write transaction, blocking while another is live.
    pub fn write_txn(&self) -> Result<WriteTransaction<'_>> {
        let guard = self.writer.lock();
        self.begin_write(guard)
    }

    /// Opens the single write transaction or fails with `Concurrent`.
    pub fn try_write_txn(&self) -> Result<WriteTransaction<'_>> {
        let guard = self.writer.try_lock().ok_or(StoreError::Concurrent)?;
        self.begin_write(guard)
    }

    fn begin_write<'env>(
        &'env self,
        guard: parking_lot::MutexGuard<'env, ()>,
    ) -> Result<WriteTransaction<'env>> {
        ensure!(!self.pager.is_disposed(), StoreError::Disposed);

        let snapshot = *self.committed.lock();
        let state = self.pager.state();

        // Pages freed by old commits become allocatable for this
        // transaction once every reader predating them is gone.
        self.freespace
            .lock()
            .drain_pending(&state, self.readers.oldest())
            .wrap_err("failed to drain pending frees at write begin")?;

        debug!(txn = snapshot.last_txn_id + 1, "txn.begin_write");
        Ok(WriteTransaction::new(self, guard, snapshot, state))
    }

    /// Sorted set of pages currently marked free, per the committed state.
    pub fn all_free_pages(&self) -> Result<Vec<u64>> {
        let next_page = self.committed.lock().next_page;
        self.freespace
            .lock()
            .all_free_pages(&self.pager.state(), next_page)
    }

    pub fn sync(&self) -> Result<()> {
        self.pager.sync()
    }

    /// Disposes the environment. Outstanding read snapshots stay valid;
    /// any new operation fails with `Disposed`.
    pub fn dispose(&self) {
        self.pager.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.pager.is_disposed()
    }
}

fn bootstrap(pager: &Pager, page_size: u32) -> Result<CommittedState> {
    // Page 0 and 1 are the header slots, page 2 is section 0's bitmap.
    let next_page = HEADER_PAGE_COUNT + 1;

    let mut header = StoreHeader::new(page_size, TreeState::empty(), next_page);
    header.seal();
    pager.write_direct(header.as_bytes(), header.slot())?;
    pager.sync().wrap_err("failed to sync bootstrap header")?;

    Ok(CommittedState {
        root: TreeState::empty(),
        next_page,
        global_etag: 0,
        last_txn_id: 0,
        generation: 0,
    })
}

fn recover(pager: &Pager, expected_page_size: u32) -> Result<CommittedState> {
    let state = pager.state();

    let header = {
        let slot0 = state.page(0)?;
        let slot1 = state.page(1)?;
        select_header(slot0, slot1).wrap_err("store header recovery failed")?
    };

    ensure!(
        header.page_size() == expected_page_size,
        StoreError::InvalidData(format!(
            "store was created with page size {}, opened with {}",
            header.page_size(),
            expected_page_size
        ))
    );
    ensure!(
        header.next_page() <= state.num_pages(),
        StoreError::Corrupt(format!(
            "header next_page {} beyond the {} mapped pages",
            header.next_page(),
            state.num_pages()
        ))
    );

    let root = header.root();
    if !root.is_empty() {
        let root_data = state
            .page(root.root_page())
            .wrap_err("root tree page unreachable")?;
        validate_page(root_data, expected_page_size).wrap_err_with(|| {
            StoreError::Corrupt(format!(
                "root tree page {} failed validation; refusing to open",
                root.root_page()
            ))
        })?;
    }

    Ok(CommittedState {
        root,
        next_page: header.next_page(),
        global_etag: header.global_etag(),
        last_txn_id: header.last_txn_id(),
        generation: header.generation(),
    })
}
