//! # Transactions
//!
//! Two transaction kinds over one environment: cheap, unbounded read
//! transactions pinned to a committed snapshot, and the single write
//! transaction that mutates through copy-on-write.
//!
//! ## Snapshots
//!
//! A read transaction captures `{root tree state, next_page, global_etag,
//! last_txn_id}` plus an `Arc<PagerState>` under a short lock and registers
//! its snapshot id with the reader registry. From then on it takes no locks:
//! every page it resolves was frozen at its snapshot, because the writer
//! only ever mutates pages no committed root reaches.
//!
//! ## Copy-on-Write
//!
//! The first write touch of a committed page `p` allocates a replacement
//! `p'` (free list first, then extension), copies the contents, rewrites
//! the embedded page number, marks `p` for commit-time free and `p'` dirty.
//! The caller repoints the parent slot at `p'`. Pages both allocated and
//! freed within one transaction short-circuit into a reusable pool — no
//! reader can ever have seen them.
//!
//! ## Commit and Rollback
//!
//! Commit flushes modified tree states into the root tree, syncs data,
//! writes and syncs the inactive header slot, publishes the new committed
//! state, then hands the freed list to the free-space manager keyed by this
//! commit's id. Rollback — explicit or by drop — returns free-list
//! allocations to the bitmap and discards everything else; the previous
//! root was never touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};
use zerocopy::IntoBytes;

use crate::config::{HEADER_PAGE_COUNT, SECTION_PAGES};
use crate::env::{CommittedState, StorageEnvironment};
use crate::errors::StoreError;
use crate::freespace::is_reserved_page;
use crate::storage::{PageHeader, PagerState, StoreHeader};
use crate::tree::{Tree, TreeState, ROOT_TREE_NAME};

/// Read access to pages, shared by both transaction kinds so tree search
/// and iteration are written once.
pub trait PageRead {
    fn page(&self, page_no: u64) -> Result<&[u8]>;
    fn page_size(&self) -> u32;
}

/// Registry of live reader snapshots. The oldest entry gates when freed
/// pages may be reused.
pub struct ReaderRegistry {
    slots: Mutex<BTreeMap<u64, usize>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, snapshot_id: u64) {
        *self.slots.lock().entry(snapshot_id).or_insert(0) += 1;
    }

    pub fn unregister(&self, snapshot_id: u64) {
        let mut slots = self.slots.lock();
        if let Some(count) = slots.get_mut(&snapshot_id) {
            *count -= 1;
            if *count == 0 {
                slots.remove(&snapshot_id);
            }
        }
    }

    /// Oldest live snapshot id, or `None` when no reader is registered.
    pub fn oldest(&self) -> Option<u64> {
        self.slots.lock().keys().next().copied()
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().values().sum()
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A consistent snapshot of the store. Many may be live at once.
pub struct ReadTransaction {
    env: Arc<StorageEnvironment>,
    snapshot: CommittedState,
    state: Arc<PagerState>,
}

impl ReadTransaction {
    pub(crate) fn new(
        env: Arc<StorageEnvironment>,
        snapshot: CommittedState,
        state: Arc<PagerState>,
    ) -> Self {
        Self {
            env,
            snapshot,
            state,
        }
    }

    pub fn snapshot_id(&self) -> u64 {
        self.snapshot.last_txn_id
    }

    pub fn global_etag(&self) -> u64 {
        self.snapshot.global_etag
    }

    pub fn root(&self) -> TreeState {
        self.snapshot.root
    }

    /// Looks a tree up by name in the root tree of this snapshot.
    pub fn open_tree(&self, name: &str) -> Result<Option<Tree>> {
        if self.snapshot.root.is_empty() {
            return Ok(None);
        }
        let root = Tree::from_state(ROOT_TREE_NAME, self.snapshot.root);
        match root.read(self, name.as_bytes())? {
            Some(bytes) => Ok(Some(Tree::from_state(name, TreeState::from_bytes(&bytes)?))),
            None => Ok(None),
        }
    }
}

impl PageRead for ReadTransaction {
    fn page(&self, page_no: u64) -> Result<&[u8]> {
        ensure!(
            page_no < self.snapshot.next_page,
            StoreError::OutOfBounds {
                page: page_no,
                limit: self.snapshot.next_page
            }
        );
        self.state.page(page_no)
    }

    fn page_size(&self) -> u32 {
        self.state.page_size()
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        self.env.readers.unregister(self.snapshot.last_txn_id);
    }
}

/// The single live write transaction.
pub struct WriteTransaction<'env> {
    env: &'env StorageEnvironment,
    _guard: MutexGuard<'env, ()>,
    state: Arc<PagerState>,
    txn_id: u64,
    generation: u64,
    root: TreeState,
    next_page: u64,
    global_etag: u64,
    dirty: HashSet<u64>,
    /// Pages taken from the bitmap this transaction; restored on rollback.
    from_free: Vec<u64>,
    /// Pages allocated and freed within this transaction; fair game for
    /// immediate in-transaction reuse.
    reusable: Vec<u64>,
    /// Committed pages this transaction freed; reusable only after commit,
    /// and only once no reader predates it.
    freed: Vec<u64>,
    trees: HashMap<String, TreeState>,
    finished: bool,
}

impl<'env> WriteTransaction<'env> {
    pub(crate) fn new(
        env: &'env StorageEnvironment,
        guard: MutexGuard<'env, ()>,
        snapshot: CommittedState,
        state: Arc<PagerState>,
    ) -> Self {
        Self {
            env,
            _guard: guard,
            state,
            txn_id: snapshot.last_txn_id + 1,
            generation: snapshot.generation,
            root: snapshot.root,
            next_page: snapshot.next_page,
            global_etag: snapshot.global_etag,
            dirty: HashSet::new(),
            from_free: Vec::new(),
            reusable: Vec::new(),
            freed: Vec::new(),
            trees: HashMap::new(),
            finished: false,
        }
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn next_page_number(&self) -> u64 {
        self.next_page
    }

    pub fn global_etag(&self) -> u64 {
        self.global_etag
    }

    /// Hands out the next document etag. Monotonic and gap-free within and
    /// across commits.
    pub fn next_etag(&mut self) -> u64 {
        self.global_etag += 1;
        self.global_etag
    }

    pub fn root(&self) -> TreeState {
        self.root
    }

    pub fn is_dirty(&self, page_no: u64) -> bool {
        self.dirty.contains(&page_no)
    }

    /// Mutable access to a page this transaction owns (allocated or COW'd).
    pub fn page_mut(&mut self, page_no: u64) -> Result<&mut [u8]> {
        ensure!(
            self.dirty.contains(&page_no),
            "page {} is not owned by this transaction",
            page_no
        );
        // SAFETY: single writer (the writer mutex is held for our
        // lifetime), the page is dirty so no reader snapshot resolves it,
        // and `&mut self` keeps this borrow exclusive within the
        // transaction.
        unsafe { self.state.page_mut(page_no) }
    }

    /// Allocates `num_pages` contiguous pages: the in-transaction reusable
    /// pool first, then the free-space bitmap, then extension. Extension
    /// steps over reserved (header/bitmap) page numbers.
    pub fn allocate(&mut self, num_pages: u64) -> Result<u64> {
        ensure!(num_pages > 0, "cannot allocate zero pages");
        ensure!(
            num_pages < SECTION_PAGES,
            StoreError::InvalidData(format!(
                "allocation of {} pages exceeds the {} page run limit",
                num_pages, SECTION_PAGES
            ))
        );

        if num_pages == 1 {
            if let Some(page) = self.reusable.pop() {
                self.dirty.insert(page);
                return Ok(page);
            }
        }

        let from_bitmap =
            self.env
                .freespace
                .lock()
                .try_allocate(&self.state, self.next_page, num_pages)?;

        let start = match from_bitmap {
            Some(page) => {
                self.from_free.extend(page..page + num_pages);
                page
            }
            None => self.extend(num_pages)?,
        };

        for page in start..start + num_pages {
            self.dirty.insert(page);
        }
        Ok(start)
    }

    fn extend(&mut self, num_pages: u64) -> Result<u64> {
        let mut start = self.next_page.max(HEADER_PAGE_COUNT + 1);

        // A run must not contain a reserved page; skipped pages go to the
        // reusable pool so single-page allocations can still claim them.
        while let Some(reserved) = first_reserved_in(start, start + num_pages) {
            for page in start..reserved {
                if !is_reserved_page(page) {
                    self.reusable.push(page);
                }
            }
            start = reserved + 1;
        }

        self.state = self.env.pager.ensure_continuous(start, num_pages)?;
        self.next_page = start + num_pages;
        Ok(start)
    }

    /// Copy-on-write touch. Returns the page to mutate: `page_no` itself
    /// when already owned, otherwise a fresh copy; the original is freed at
    /// commit. The caller repoints whatever referenced `page_no`.
    pub fn modify_page(&mut self, page_no: u64) -> Result<u64> {
        if self.dirty.contains(&page_no) {
            return Ok(page_no);
        }
        ensure!(
            !is_reserved_page(page_no),
            StoreError::Corrupt(format!("attempt to modify reserved page {}", page_no))
        );

        let copy = self.allocate(1)?;
        // SAFETY: single writer; the source is a committed page no longer
        // being mutated, the destination is freshly allocated.
        unsafe { self.state.copy_page(page_no, copy)? };
        {
            let data = self.page_mut(copy)?;
            PageHeader::from_bytes_mut(data)?.set_page_no(copy);
        }
        self.freed.push(page_no);

        Ok(copy)
    }

    /// Schedules a page run for freeing. Pages this transaction allocated
    /// go straight to the reusable pool; committed pages wait for commit
    /// plus reader catch-up.
    pub fn free_run(&mut self, start: u64, num_pages: u64) {
        for page in start..start + num_pages {
            if self.dirty.remove(&page) {
                self.reusable.push(page);
            } else {
                self.freed.push(page);
            }
        }
    }

    pub fn free_page(&mut self, page_no: u64) {
        self.free_run(page_no, 1);
    }

    /// The tree under `name`, starting from any state this transaction has
    /// already recorded, else the committed root tree.
    pub fn open_tree(&self, name: &str) -> Result<Option<Tree>> {
        if let Some(state) = self.trees.get(name) {
            return Ok(Some(Tree::from_state(name, *state)));
        }
        if self.root.is_empty() {
            return Ok(None);
        }
        let root = Tree::from_state(ROOT_TREE_NAME, self.root);
        match root.read(self, name.as_bytes())? {
            Some(bytes) => Ok(Some(Tree::from_state(name, TreeState::from_bytes(&bytes)?))),
            None => Ok(None),
        }
    }

    /// Opens a tree, creating it empty on first use. The tree materializes
    /// its root page on its first insert.
    pub fn open_or_create_tree(&self, name: &str) -> Result<Tree> {
        Ok(self
            .open_tree(name)?
            .unwrap_or_else(|| Tree::from_state(name, TreeState::empty())))
    }

    /// Records a tree's state for the commit-time flush into the root tree.
    pub fn update_tree(&mut self, tree: &Tree) {
        self.trees.insert(tree.name().to_string(), *tree.state());
    }

    /// Sorted set of currently free pages as this transaction sees them.
    pub fn all_free_pages(&self) -> Result<Vec<u64>> {
        self.env
            .freespace
            .lock()
            .all_free_pages(&self.state, self.next_page)
    }

    pub fn commit(mut self) -> Result<()> {
        self.flush_tree_states()
            .wrap_err("failed to flush tree states into the root tree")?;

        self.env
            .pager
            .sync()
            .wrap_err("data sync before header publish failed")?;

        let generation = self.generation + 1;
        let mut header = StoreHeader::new(self.state.page_size(), self.root, self.next_page);
        header.set_global_etag(self.global_etag);
        header.set_last_txn_id(self.txn_id);
        header.set_generation(generation);
        header.seal();
        self.env
            .pager
            .write_direct(header.as_bytes(), header.slot())?;
        self.env
            .pager
            .sync()
            .wrap_err("header sync after slot write failed")?;

        {
            let mut committed = self.env.committed.lock();
            *committed = CommittedState {
                root: self.root,
                next_page: self.next_page,
                global_etag: self.global_etag,
                last_txn_id: self.txn_id,
                generation,
            };
        }

        {
            let mut freespace = self.env.freespace.lock();
            for page in std::mem::take(&mut self.reusable) {
                freespace.free_page(&self.state, page)?;
            }
            freespace.register_pending(self.txn_id, std::mem::take(&mut self.freed));
            freespace.drain_pending(&self.state, self.env.readers.oldest())?;
        }

        debug!(
            txn = self.txn_id,
            generation,
            next_page = self.next_page,
            "txn.commit"
        );
        self.finished = true;
        Ok(())
    }

    /// Abandons the transaction. Equivalent to dropping it.
    pub fn rollback(mut self) {
        self.finish_rollback();
    }

    fn flush_tree_states(&mut self) -> Result<()> {
        if self.trees.is_empty() {
            return Ok(());
        }

        let mut updates: Vec<(String, TreeState)> = self.trees.drain().collect();
        updates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut root = Tree::from_state(ROOT_TREE_NAME, self.root);
        for (name, state) in updates {
            root.add(self, name.as_bytes(), state.as_bytes())?;
        }
        self.root = *root.state();
        Ok(())
    }

    fn finish_rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut freespace = self.env.freespace.lock();
        for page in self.from_free.drain(..) {
            if let Err(err) = freespace.free_page(&self.state, page) {
                warn!(page, %err, "txn.rollback.restore_failed");
            }
        }
        debug!(txn = self.txn_id, "txn.rollback");
    }
}

impl PageRead for WriteTransaction<'_> {
    fn page(&self, page_no: u64) -> Result<&[u8]> {
        self.state.page(page_no)
    }

    fn page_size(&self) -> u32 {
        self.state.page_size()
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.finish_rollback();
    }
}

fn first_reserved_in(start: u64, end: u64) -> Option<u64> {
    // The only reserved pages past the initial three are section bitmap
    // pages at multiples of SECTION_PAGES.
    let first_multiple = start.div_ceil(SECTION_PAGES) * SECTION_PAGES;
    (first_multiple >= SECTION_PAGES && first_multiple < end).then_some(first_multiple)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvOptions, StorageEnvironment};

    fn env() -> Arc<StorageEnvironment> {
        StorageEnvironment::open(EnvOptions::memory()).unwrap()
    }

    #[test]
    fn reader_registry_tracks_oldest() {
        let registry = ReaderRegistry::new();

        registry.register(5);
        registry.register(3);
        registry.register(3);

        assert_eq!(registry.oldest(), Some(3));
        registry.unregister(3);
        assert_eq!(registry.oldest(), Some(3));
        registry.unregister(3);
        assert_eq!(registry.oldest(), Some(5));
        registry.unregister(5);
        assert_eq!(registry.oldest(), None);
    }

    #[test]
    fn allocation_extends_past_the_committed_tail() {
        let env = env();
        let mut tx = env.write_txn().unwrap();

        let first = tx.allocate(1).unwrap();
        let second = tx.allocate(2).unwrap();

        assert_eq!(first, 3);
        assert_eq!(second, 4);
        assert_eq!(tx.next_page_number(), 6);
    }

    #[test]
    fn freed_dirty_pages_are_reused_in_transaction() {
        let env = env();
        let mut tx = env.write_txn().unwrap();

        let page = tx.allocate(1).unwrap();
        tx.free_page(page);
        let again = tx.allocate(1).unwrap();

        assert_eq!(page, again);
    }

    #[test]
    fn modify_page_copies_and_schedules_free() {
        let env = env();

        // Commit a page so it is no longer dirty.
        let page = {
            let mut tx = env.write_txn().unwrap();
            let page = tx.allocate(1).unwrap();
            tx.page_mut(page).unwrap()[100] = 0x5A;
            tx.commit().unwrap();
            page
        };

        let mut tx = env.write_txn().unwrap();
        let copy = tx.modify_page(page).unwrap();

        assert_ne!(copy, page);
        assert_eq!(tx.page(copy).unwrap()[100], 0x5A);
        assert_eq!(tx.modify_page(copy).unwrap(), copy);
    }

    #[test]
    fn rollback_restores_bitmap_allocations() {
        let env = env();

        // Free one committed page so the bitmap has something to serve.
        let page = {
            let mut tx = env.write_txn().unwrap();
            let page = tx.allocate(1).unwrap();
            tx.commit().unwrap();
            page
        };
        {
            let mut tx = env.write_txn().unwrap();
            tx.free_page(page);
            tx.commit().unwrap();
        }

        {
            let mut tx = env.write_txn().unwrap();
            assert_eq!(tx.allocate(1).unwrap(), page);
            tx.rollback();
        }

        let mut tx = env.write_txn().unwrap();
        assert_eq!(tx.allocate(1).unwrap(), page);
    }

    #[test]
    fn commit_parks_freed_pages_until_readers_finish() {
        let env = env();

        let page = {
            let mut tx = env.write_txn().unwrap();
            let page = tx.allocate(1).unwrap();
            tx.commit().unwrap();
            page
        };

        let reader = env.read_txn().unwrap();

        {
            let mut tx = env.write_txn().unwrap();
            tx.free_page(page);
            tx.commit().unwrap();
        }

        // The reader predates the freeing commit: the page must not return.
        {
            let mut tx = env.write_txn().unwrap();
            assert_ne!(tx.allocate(1).unwrap(), page);
            tx.rollback();
        }

        drop(reader);

        let mut tx = env.write_txn().unwrap();
        assert_eq!(tx.allocate(1).unwrap(), page);
    }

    #[test]
    fn etags_are_contiguous_across_commits() {
        let env = env();

        let mut tx = env.write_txn().unwrap();
        assert_eq!(tx.next_etag(), 1);
        assert_eq!(tx.next_etag(), 2);
        tx.commit().unwrap();

        let mut tx = env.write_txn().unwrap();
        assert_eq!(tx.next_etag(), 3);
        tx.rollback();

        // A rolled back transaction publishes nothing.
        let mut tx = env.write_txn().unwrap();
        assert_eq!(tx.next_etag(), 3);
    }

    #[test]
    fn extension_skips_section_bitmap_pages() {
        assert_eq!(first_reserved_in(3, 10), None);
        assert_eq!(
            first_reserved_in(SECTION_PAGES - 1, SECTION_PAGES + 2),
            Some(SECTION_PAGES)
        );
        assert_eq!(first_reserved_in(SECTION_PAGES + 1, SECTION_PAGES + 5), None);
    }
}
