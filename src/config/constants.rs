//! # Configuration Constants
//!
//! This module centralizes the layout and policy constants of the page store,
//! grouping interdependent values together. Constants that depend on each
//! other are co-located so a change to one is checked against the others at
//! compile time.
//!
//! ## Dependency Graph
//!
//! ```text
//! page_size (4096 or 8192, chosen at environment creation)
//!       │
//!       ├─> PAGE_HEADER_SIZE (24 bytes, fixed)
//!       │     Every page starts with this header; the usable space of a
//!       │     page is page_size - PAGE_HEADER_SIZE.
//!       │
//!       ├─> MAX_KEY_CAP (2038 bytes)
//!       │     Upper bound on tree keys regardless of page size; the
//!       │     per-page-size limit is (usable/2) - MAX_NODE_OVERHEAD - 1.
//!       │
//!       └─> overflow chunk size (usable space per overflow page)
//!
//! SECTION_PAGES (2048)
//!       │
//!       └─> One bitmap page tracks SECTION_PAGES allocation bits.
//!           SECTION_PAGES / 8 bytes of bits must fit in the smallest
//!           supported page after its header (enforced below).
//!
//! HEADER_PAGE_COUNT (2)
//!       │
//!       └─> Pages 0 and 1 hold the double-buffered store headers; the
//!           first data page is page 3 (page 2 is section 0's bitmap).
//! ```

/// Smallest supported page size in bytes.
pub const MIN_PAGE_SIZE: u32 = 4096;

/// Largest supported page size in bytes.
pub const MAX_PAGE_SIZE: u32 = 8192;

/// Default page size for new environments.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Size of the per-page header. Every page, including overflow and bitmap
/// pages, begins with this header.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Number of double-buffered store header pages at the front of the file.
pub const HEADER_PAGE_COUNT: u64 = 2;

/// Pages tracked by one free-space bitmap page.
pub const SECTION_PAGES: u64 = 2048;

/// Current on-disk schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Number of pages a fresh environment is sized to before any growth.
pub const INITIAL_PAGE_COUNT: u64 = 16;

// ============================================================================
// GROWTH POLICY
// The pager throttles file growth: bursts of writes double the increment,
// quiet periods shrink it back, and a single grow never exceeds a quarter of
// the current length (rounded up to a power of two).
// ============================================================================

/// Starting growth increment, in pages (16 pages = 64 KiB at 4 KiB pages).
pub const MIN_INCREASE_PAGES: u64 = 16;

/// Largest growth increment, in pages (1 GiB at 4 KiB pages).
pub const MAX_INCREASE_PAGES: u64 = 262_144;

/// A grow within this window of the previous one doubles the increment.
pub const GROWTH_FAST_WINDOW_SECS: u64 = 30;

/// A grow after this much idle time halves the increment.
pub const GROWTH_SLOW_WINDOW_SECS: u64 = 120;

// ============================================================================
// TREE LAYOUT
// ============================================================================

/// Hard cap on tree key length, independent of page size.
pub const MAX_KEY_CAP: usize = 2038;

/// Worst-case bytes of node metadata around a key: flag byte, 2-byte key
/// length varint, overflow payload reference (8-byte page + 4-byte size),
/// and the slot entry.
pub const MAX_NODE_OVERHEAD: usize = 1 + 2 + 12 + 2;

/// A page whose used space falls below usable/PAGE_MIN_FILL_DIVISOR is
/// merged or rebalanced after a delete.
pub const PAGE_MIN_FILL_DIVISOR: usize = 3;

/// Values larger than usable/MAX_INLINE_VALUE_DIVISOR move to overflow runs.
pub const MAX_INLINE_VALUE_DIVISOR: usize = 4;

// ============================================================================
// INDEXING DEFAULTS
// ============================================================================

/// Documents pulled per map batch.
pub const DEFAULT_INDEX_BATCH_SIZE: usize = 1024;

/// Soft budget for one map batch, in milliseconds.
pub const DEFAULT_DOC_PROCESSING_TIMEOUT_MS: u64 = 250;

/// Soft budget for one tombstone-cleanup batch, in milliseconds.
pub const DEFAULT_TOMBSTONE_PROCESSING_TIMEOUT_MS: u64 = 250;

/// Pause after an unexpected indexing error before the next pass.
pub const INDEX_ERROR_BACKOFF_MS: u64 = 500;

const _: () = assert!(
    (SECTION_PAGES as usize / 8) + PAGE_HEADER_SIZE <= MIN_PAGE_SIZE as usize,
    "a section's bitmap bits must fit in one page of the smallest supported size"
);

const _: () = assert!(
    MAX_KEY_CAP + MAX_NODE_OVERHEAD < (MIN_PAGE_SIZE as usize - PAGE_HEADER_SIZE) / 2,
    "two maximum-size keys must fit in one page so branch pages can always hold a split"
);

const _: () = assert!(
    MIN_INCREASE_PAGES <= MAX_INCREASE_PAGES,
    "growth increment bounds are inverted"
);

const _: () = assert!(
    INITIAL_PAGE_COUNT > HEADER_PAGE_COUNT + 1,
    "a fresh environment needs room for both headers and section 0's bitmap"
);

/// Usable bytes of a page after its header.
#[inline]
pub const fn page_space(page_size: u32) -> usize {
    page_size as usize - PAGE_HEADER_SIZE
}

/// Largest key accepted by trees in an environment of the given page size.
#[inline]
pub const fn max_key_size(page_size: u32) -> usize {
    let derived = page_space(page_size) / 2 - MAX_NODE_OVERHEAD - 1;
    if derived < MAX_KEY_CAP {
        derived
    } else {
        MAX_KEY_CAP
    }
}

/// Largest value stored inline in a leaf; anything bigger goes to an
/// overflow run.
#[inline]
pub const fn max_inline_value(page_size: u32) -> usize {
    page_space(page_size) / MAX_INLINE_VALUE_DIVISOR
}
