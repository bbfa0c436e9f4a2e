//! Persistent per-tree bookkeeping. A tree's state is the 48-byte record the
//! root tree stores under the tree's name; the root tree's own state lives in
//! the store header.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const TREE_STATE_SIZE: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TreeState {
    root_page: U64,
    depth: U32,
    flags: U32,
    branch_pages: U64,
    leaf_pages: U64,
    overflow_pages: U64,
    entries: U64,
}

const _: () = assert!(std::mem::size_of::<TreeState>() == TREE_STATE_SIZE);

impl TreeState {
    /// State of a tree with no pages yet. `root_page == 0` is the empty
    /// sentinel: page 0 holds a store header and can never be a tree root.
    pub fn empty() -> Self {
        Self {
            root_page: U64::new(0),
            depth: U32::new(0),
            flags: U32::new(0),
            branch_pages: U64::new(0),
            leaf_pages: U64::new(0),
            overflow_pages: U64::new(0),
            entries: U64::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= TREE_STATE_SIZE,
            "buffer too small for TreeState: {} < {}",
            bytes.len(),
            TREE_STATE_SIZE
        );

        Self::read_from_bytes(&bytes[..TREE_STATE_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse TreeState: {:?}", e))
    }

    pub fn is_empty(&self) -> bool {
        self.root_page.get() == 0
    }

    pub fn root_page(&self) -> u64 {
        self.root_page.get()
    }

    pub fn set_root_page(&mut self, page: u64) {
        self.root_page = U64::new(page);
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn set_depth(&mut self, depth: u32) {
        self.depth = U32::new(depth);
    }

    pub fn branch_pages(&self) -> u64 {
        self.branch_pages.get()
    }

    pub fn leaf_pages(&self) -> u64 {
        self.leaf_pages.get()
    }

    pub fn overflow_pages(&self) -> u64 {
        self.overflow_pages.get()
    }

    pub fn entries(&self) -> u64 {
        self.entries.get()
    }

    pub fn add_branch_pages(&mut self, delta: i64) {
        self.branch_pages = U64::new(self.branch_pages.get().wrapping_add_signed(delta));
    }

    pub fn add_leaf_pages(&mut self, delta: i64) {
        self.leaf_pages = U64::new(self.leaf_pages.get().wrapping_add_signed(delta));
    }

    pub fn add_overflow_pages(&mut self, delta: i64) {
        self.overflow_pages = U64::new(self.overflow_pages.get().wrapping_add_signed(delta));
    }

    pub fn add_entries(&mut self, delta: i64) {
        self.entries = U64::new(self.entries.get().wrapping_add_signed(delta));
    }

    /// Total pages owned by the tree, bitmap overhead excluded.
    pub fn page_count(&self) -> u64 {
        self.branch_pages.get() + self.leaf_pages.get() + self.overflow_pages.get()
    }
}

impl Default for TreeState {
    fn default() -> Self {
        Self::empty()
    }
}
