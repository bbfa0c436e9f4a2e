//! # Storage Layer
//!
//! Page-granular storage for the store: the pager with its refcounted
//! mapping snapshots, the fixed per-page header, and the double-buffered
//! store header that anchors recovery.
//!
//! Everything above this layer addresses pages by number; only the pager
//! knows where a page lives in memory. All on-disk layouts are little-endian
//! zerocopy structs parsed in place over the mapped region.
//!
//! - `pager`: heap- and mmap-backed page space with throttled growth
//! - `page`: the 24-byte page header shared by every page kind
//! - `headers`: store header slots, checksums, recovery selection

mod headers;
mod page;
mod pager;

pub use headers::{select_header, StoreHeader, STORE_HEADER_SIZE, STORE_MAGIC};
pub use page::{
    validate_page, PageHeader, PAGE_FLAG_BRANCH, PAGE_FLAG_FREE_SPACE_BITMAP, PAGE_FLAG_LEAF,
    PAGE_FLAG_OVERFLOW,
};
pub use pager::{Pager, PagerState};
