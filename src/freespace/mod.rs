//! # Free-Space Manager
//!
//! Tracks which pages are free through per-section allocation bitmaps stored
//! inside the store itself, and gates the reuse of freed pages on reader
//! snapshots.
//!
//! ## Sections
//!
//! The page space is partitioned into fixed sections of `SECTION_PAGES`
//! pages. Section `s` covers pages `[s * SECTION_PAGES, (s+1) * SECTION_PAGES)`
//! and its allocation bitmap lives in the section's first page — except
//! section 0, whose first two pages are the store headers, so its bitmap
//! sits on page 2. Bitmap pages are never handed out by the allocator and
//! never copy-on-write: readers have no reason to address them, and the
//! writer lock serializes every mutation.
//!
//! ## Bit Semantics
//!
//! A set bit means *free*. A zeroed bitmap page therefore describes a fully
//! allocated section, which is exactly the state of freshly grown (zeroed)
//! regions — sections need no initialization pass before their first free.
//! The bitmap page carries the free-space flag in its header once touched;
//! a section whose bitmap page lacks the flag has never seen a free.
//!
//! ## Pending Frees
//!
//! Pages freed by a committing write transaction must not be reused while a
//! reader with an older snapshot could still reach them. Commit therefore
//! parks its freed list here keyed by the commit id; `drain` flips the bits
//! once the oldest live reader's snapshot has caught up (or no reader is
//! live). The write path drains at transaction begin and after commit.
//!
//! ## Bookkeeping Recursion
//!
//! The bitmaps are themselves pages of the store, but they sit at
//! deterministic page numbers carved out of the allocatable space, so
//! flipping bits never allocates and the recursion grounds out.

use std::collections::BTreeMap;

use eyre::{ensure, Result};
use tracing::debug;

use crate::config::{HEADER_PAGE_COUNT, PAGE_HEADER_SIZE, SECTION_PAGES};
use crate::errors::StoreError;
use crate::storage::{PageHeader, PagerState, PAGE_FLAG_FREE_SPACE_BITMAP};

const SECTION_BITMAP_BYTES: usize = (SECTION_PAGES / 8) as usize;

#[inline]
pub fn section_of(page: u64) -> u64 {
    page / SECTION_PAGES
}

/// Deterministic bitmap page of a section.
#[inline]
pub fn bitmap_page(section: u64) -> u64 {
    if section == 0 {
        HEADER_PAGE_COUNT
    } else {
        section * SECTION_PAGES
    }
}

/// Pages the allocator must never hand out: header pages and bitmap pages.
#[inline]
pub fn is_reserved_page(page: u64) -> bool {
    page < HEADER_PAGE_COUNT
        || page == HEADER_PAGE_COUNT
        || (page >= SECTION_PAGES && page % SECTION_PAGES == 0)
}

pub struct FreeSpace {
    pending: BTreeMap<u64, Vec<u64>>,
}

impl FreeSpace {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    /// First run of `num_pages` consecutive free pages, scanning sections in
    /// ascending order. Clears the bits on success. Runs never cross a
    /// section boundary (the bitmap page in the middle would break them
    /// anyway), so requests of a section or more always fall through to
    /// extension.
    pub fn try_allocate(
        &mut self,
        state: &PagerState,
        next_page: u64,
        num_pages: u64,
    ) -> Result<Option<u64>> {
        ensure!(num_pages > 0, "cannot allocate zero pages");
        if num_pages >= SECTION_PAGES {
            return Ok(None);
        }

        let last_section = section_of(next_page.saturating_sub(1));

        for section in 0..=last_section {
            let bitmap = bitmap_page(section);
            if bitmap >= next_page || bitmap >= state.num_pages() {
                break;
            }

            let found = {
                let data = state.page(bitmap)?;
                if !PageHeader::from_bytes(data)?.is_free_space_bitmap() {
                    continue;
                }
                find_free_run(data, section, next_page, num_pages)
            };

            if let Some(run_start) = found {
                // SAFETY: caller holds the writer lock; bitmap pages are
                // invisible to readers.
                let data = unsafe { state.page_mut(bitmap)? };
                for page in run_start..run_start + num_pages {
                    clear_bit(data, (page - section * SECTION_PAGES) as usize)?;
                }
                debug!(page = run_start, count = num_pages, "freespace.allocate");
                return Ok(Some(run_start));
            }
        }

        Ok(None)
    }

    /// Marks a page free in its section's bitmap. Freeing a reserved page or
    /// a page that is already free is bitmap corruption.
    pub fn free_page(&mut self, state: &PagerState, page: u64) -> Result<()> {
        ensure!(
            !is_reserved_page(page),
            StoreError::Corrupt(format!("attempt to free reserved page {}", page))
        );

        let section = section_of(page);
        let bitmap = bitmap_page(section);

        // SAFETY: caller holds the writer lock; bitmap pages are invisible
        // to readers.
        let data = unsafe { state.page_mut(bitmap)? };

        if !PageHeader::from_bytes(data)?.is_free_space_bitmap() {
            PageHeader::new(bitmap, PAGE_FLAG_FREE_SPACE_BITMAP).write_to(data)?;
            data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + SECTION_BITMAP_BYTES].fill(0);
        }

        let idx = (page - section * SECTION_PAGES) as usize;
        let byte = &mut data[PAGE_HEADER_SIZE + idx / 8];
        let mask = 1u8 << (idx % 8);
        ensure!(
            *byte & mask == 0,
            StoreError::Corrupt(format!("page {} freed twice", page))
        );
        *byte |= mask;

        Ok(())
    }

    /// Parks a committed transaction's freed pages until readers catch up.
    pub fn register_pending(&mut self, commit_id: u64, pages: Vec<u64>) {
        if pages.is_empty() {
            return;
        }
        self.pending.entry(commit_id).or_default().extend(pages);
    }

    /// Flips the bits of every pending list whose commit no live reader
    /// predates. `oldest_live` is the oldest registered reader snapshot.
    pub fn drain_pending(
        &mut self,
        state: &PagerState,
        oldest_live: Option<u64>,
    ) -> Result<usize> {
        let mut drained = 0;

        while let Some((&commit_id, _)) = self.pending.iter().next() {
            let eligible = oldest_live.map_or(true, |oldest| oldest >= commit_id);
            if !eligible {
                break;
            }

            let pages = self.pending.remove(&commit_id).unwrap();
            for page in pages {
                self.free_page(state, page)?;
                drained += 1;
            }
        }

        if drained > 0 {
            debug!(pages = drained, "freespace.drain");
        }
        Ok(drained)
    }

    /// Sorted list of every page currently marked free. Pending pages are
    /// not free yet and are excluded.
    pub fn all_free_pages(&self, state: &PagerState, next_page: u64) -> Result<Vec<u64>> {
        let mut free = Vec::new();
        let last_section = section_of(next_page.saturating_sub(1));

        for section in 0..=last_section {
            let bitmap = bitmap_page(section);
            if bitmap >= next_page || bitmap >= state.num_pages() {
                break;
            }

            let data = state.page(bitmap)?;
            if !PageHeader::from_bytes(data)?.is_free_space_bitmap() {
                continue;
            }

            let bits = &data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + SECTION_BITMAP_BYTES];
            for i in 0..SECTION_PAGES {
                let page = section * SECTION_PAGES + i;
                if page >= next_page {
                    break;
                }
                if bits[(i / 8) as usize] & (1 << (i % 8)) != 0 {
                    free.push(page);
                }
            }
        }

        Ok(free)
    }

    pub fn pending_page_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

impl Default for FreeSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn find_free_run(data: &[u8], section: u64, next_page: u64, num_pages: u64) -> Option<u64> {
    let bits = &data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + SECTION_BITMAP_BYTES];
    let mut run_start = 0u64;
    let mut run_len = 0u64;

    for i in 0..SECTION_PAGES {
        let page = section * SECTION_PAGES + i;
        if page >= next_page {
            break;
        }

        if bits[(i / 8) as usize] & (1 << (i % 8)) != 0 {
            if run_len == 0 {
                run_start = page;
            }
            run_len += 1;
            if run_len == num_pages {
                return Some(run_start);
            }
        } else {
            run_len = 0;
        }
    }

    None
}

fn clear_bit(data: &mut [u8], idx: usize) -> Result<()> {
    let byte = &mut data[PAGE_HEADER_SIZE + idx / 8];
    let mask = 1u8 << (idx % 8);
    ensure!(
        *byte & mask != 0,
        StoreError::Corrupt(format!("allocation bit {} already clear", idx))
    );
    *byte &= !mask;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Pager;

    fn setup(pages: u64) -> (Pager, std::sync::Arc<PagerState>) {
        let pager = Pager::memory(4096, None, None).unwrap();
        let state = pager.ensure_continuous(pages, 1).unwrap();
        (pager, state)
    }

    #[test]
    fn reserved_pages_are_recognized() {
        assert!(is_reserved_page(0));
        assert!(is_reserved_page(1));
        assert!(is_reserved_page(2));
        assert!(!is_reserved_page(3));
        assert!(is_reserved_page(SECTION_PAGES));
        assert!(!is_reserved_page(SECTION_PAGES + 1));
        assert!(is_reserved_page(SECTION_PAGES * 2));
    }

    #[test]
    fn allocate_from_empty_bitmap_returns_none() {
        let (_pager, state) = setup(16);
        let mut fs = FreeSpace::new();

        assert!(fs.try_allocate(&state, 16, 1).unwrap().is_none());
    }

    #[test]
    fn freed_page_is_reallocated() {
        let (_pager, state) = setup(16);
        let mut fs = FreeSpace::new();

        fs.free_page(&state, 7).unwrap();

        assert_eq!(fs.try_allocate(&state, 16, 1).unwrap(), Some(7));
        assert!(fs.try_allocate(&state, 16, 1).unwrap().is_none());
    }

    #[test]
    fn double_free_is_corruption() {
        let (_pager, state) = setup(16);
        let mut fs = FreeSpace::new();

        fs.free_page(&state, 7).unwrap();
        let err = fs.free_page(&state, 7).unwrap_err();

        assert!(matches!(
            crate::errors::store_error(&err),
            Some(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn freeing_a_reserved_page_is_corruption() {
        let (_pager, state) = setup(16);
        let mut fs = FreeSpace::new();

        assert!(fs.free_page(&state, 0).is_err());
        assert!(fs.free_page(&state, 2).is_err());
    }

    #[test]
    fn contiguous_runs_are_found_in_order() {
        let (_pager, state) = setup(32);
        let mut fs = FreeSpace::new();

        for page in [5, 6, 7, 10, 11] {
            fs.free_page(&state, page).unwrap();
        }

        assert_eq!(fs.try_allocate(&state, 32, 3).unwrap(), Some(5));
        assert_eq!(fs.try_allocate(&state, 32, 2).unwrap(), Some(10));
        assert!(fs.try_allocate(&state, 32, 2).unwrap().is_none());
    }

    #[test]
    fn free_in_a_later_section_is_found() {
        let next_page = SECTION_PAGES + 16;
        let (_pager, state) = setup(next_page);
        let mut fs = FreeSpace::new();

        fs.free_page(&state, SECTION_PAGES + 1).unwrap();

        assert_eq!(
            fs.try_allocate(&state, next_page, 1).unwrap(),
            Some(SECTION_PAGES + 1)
        );
    }

    #[test]
    fn pending_pages_wait_for_readers() {
        let (_pager, state) = setup(16);
        let mut fs = FreeSpace::new();

        fs.register_pending(5, vec![8, 9]);

        // A reader with snapshot 4 predates commit 5: nothing drains.
        assert_eq!(fs.drain_pending(&state, Some(4)).unwrap(), 0);
        assert!(fs.try_allocate(&state, 16, 1).unwrap().is_none());

        // Once the oldest reader is at 5, commit 5's pages become free.
        assert_eq!(fs.drain_pending(&state, Some(5)).unwrap(), 2);
        assert_eq!(fs.try_allocate(&state, 16, 1).unwrap(), Some(8));
    }

    #[test]
    fn drain_without_readers_frees_everything() {
        let (_pager, state) = setup(16);
        let mut fs = FreeSpace::new();

        fs.register_pending(3, vec![4]);
        fs.register_pending(7, vec![5, 6]);

        assert_eq!(fs.drain_pending(&state, None).unwrap(), 3);
        assert_eq!(fs.pending_page_count(), 0);
        assert_eq!(fs.all_free_pages(&state, 16).unwrap(), vec![4, 5, 6]);
    }

    #[test]
    fn all_free_pages_is_sorted_and_exact() {
        let (_pager, state) = setup(16);
        let mut fs = FreeSpace::new();

        for page in [12, 4, 9] {
            fs.free_page(&state, page).unwrap();
        }

        assert_eq!(fs.all_free_pages(&state, 16).unwrap(), vec![4, 9, 12]);
    }
}
