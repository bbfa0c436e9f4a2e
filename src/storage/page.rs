//! # Page Header Layout
//!
//! Every page in the store begins with a 24-byte header. The header is a
//! plain little-endian layout read and written in place over the mapped
//! region through zerocopy.
//!
//! ## Header Layout (24 bytes)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       8     page_no        Page's own number; rewritten on COW copy
//! 8       4     overflow_size  Total value bytes, first overflow page only
//! 12      1     flags          leaf / branch / overflow / bitmap bits
//! 13      1     tree_flags     Per-tree bits, reserved
//! 14      2     lower          End of the slot array (tree pages)
//! 16      2     upper          Start of the node records (tree pages)
//! 18      6     reserved
//! ```
//!
//! ## Tree Page Layout
//!
//! Tree pages are slotted. Two-byte slot offsets grow upward from byte 24
//! (`lower` marks their end); variable-length node records grow downward
//! from the page end (`upper` marks the lowest record). Free space is
//! `upper - lower`:
//!
//! ```text
//! +----------------------+
//! | Header (24 bytes)    |
//! +----------------------+
//! | Slot offsets (2B)    |  <- grows up, ends at `lower`
//! +----------------------+
//! | Free space           |
//! +----------------------+
//! | Node records         |  <- grows down, starts at `upper`
//! +----------------------+
//! ```
//!
//! Overflow and free-space bitmap pages use only the fixed header; their
//! remaining bytes are raw value data or allocation bits respectively.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_HEADER_SIZE;

pub const PAGE_FLAG_LEAF: u8 = 0b0001;
pub const PAGE_FLAG_BRANCH: u8 = 0b0010;
pub const PAGE_FLAG_OVERFLOW: u8 = 0b0100;
pub const PAGE_FLAG_FREE_SPACE_BITMAP: u8 = 0b1000;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_no: U64,
    overflow_size: U32,
    flags: u8,
    tree_flags: u8,
    lower: U16,
    upper: U16,
    reserved: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(page_no: u64, flags: u8) -> Self {
        Self {
            page_no: U64::new(page_no),
            overflow_size: U32::new(0),
            flags,
            tree_flags: 0,
            lower: U16::new(0),
            upper: U16::new(0),
            reserved: [0; 6],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_no(&self) -> u64 {
        self.page_no.get()
    }

    pub fn set_page_no(&mut self, page_no: u64) {
        self.page_no = U64::new(page_no);
    }

    pub fn overflow_size(&self) -> u32 {
        self.overflow_size.get()
    }

    pub fn set_overflow_size(&mut self, size: u32) {
        self.overflow_size = U32::new(size);
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & PAGE_FLAG_LEAF != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags & PAGE_FLAG_BRANCH != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.flags & PAGE_FLAG_OVERFLOW != 0
    }

    pub fn is_free_space_bitmap(&self) -> bool {
        self.flags & PAGE_FLAG_FREE_SPACE_BITMAP != 0
    }

    pub fn tree_flags(&self) -> u8 {
        self.tree_flags
    }

    pub fn set_tree_flags(&mut self, flags: u8) {
        self.tree_flags = flags;
    }

    pub fn lower(&self) -> u16 {
        self.lower.get()
    }

    pub fn set_lower(&mut self, lower: u16) {
        self.lower = U16::new(lower);
    }

    pub fn upper(&self) -> u16 {
        self.upper.get()
    }

    pub fn set_upper(&mut self, upper: u16) {
        self.upper = U16::new(upper);
    }

    pub fn free_space(&self) -> u16 {
        self.upper.get().saturating_sub(self.lower.get())
    }
}

/// Sanity-checks a tree page's header against the page size. A fully zeroed
/// header is accepted: freshly grown regions are zero-filled.
pub fn validate_page(data: &[u8], page_size: u32) -> Result<()> {
    ensure!(
        data.len() == page_size as usize,
        "invalid page size: {} != {}",
        data.len(),
        page_size
    );

    let header = PageHeader::from_bytes(data)?;

    let is_zeroed = header.flags == 0 && header.lower.get() == 0 && header.upper.get() == 0;
    if is_zeroed {
        return Ok(());
    }

    if header.is_leaf() || header.is_branch() {
        ensure!(
            !(header.is_leaf() && header.is_branch()),
            "page {} claims to be both leaf and branch",
            header.page_no()
        );
        ensure!(
            header.lower() as usize >= PAGE_HEADER_SIZE,
            "page {}: lower {} inside the header",
            header.page_no(),
            header.lower()
        );
        ensure!(
            header.upper() as u32 <= page_size,
            "page {}: upper {} beyond the page end",
            header.page_no(),
            header.upper()
        );
        ensure!(
            header.lower() <= header.upper(),
            "page {}: lower {} > upper {}",
            header.page_no(),
            header.lower(),
            header.upper()
        );
    }

    Ok(())
}
