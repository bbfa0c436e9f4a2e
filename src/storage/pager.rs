//! # Pager
//!
//! The pager maps a contiguous page space onto a backing region and owns the
//! page-number-to-address translation. Two backings share one type: an
//! anonymous heap region (memory-only stores) and a memory-mapped file.
//!
//! ## Snapshot Handles
//!
//! Growing the region remaps it, which would invalidate the addresses held
//! by concurrent readers. The pager therefore never hands out its mapping
//! directly: callers clone an `Arc<PagerState>` snapshot handle at
//! transaction open. A grow installs a fresh `PagerState` as the current one
//! while every old handle stays alive until its holders drop it:
//!
//! ```text
//! reader A ──> Arc<PagerState gen 1> ─┐
//! reader B ──> Arc<PagerState gen 2> ─┼─ all valid simultaneously
//! pager    ──> Arc<PagerState gen 3> ─┘   (current)
//! ```
//!
//! File backings remap the same file, so every generation observes the same
//! bytes for the pages it covers. Heap backings copy on grow; copy-on-write
//! up the stack guarantees that pages visible to an old snapshot are never
//! rewritten, so the stale copy is indistinguishable for its readers.
//!
//! ## Growth Throttling
//!
//! Growth is throttled so small stores do not balloon while sustained write
//! loads amortize remap cost: the increment starts at 16 pages, doubles when
//! grows come faster than 30 s apart (capped), halves after 2 min of quiet
//! (floored), and the applied growth is `min(increment, length/4)` rounded
//! up to a power of two.
//!
//! ## Safety Model
//!
//! `PagerState` exposes `page()` for shared reads and an `unsafe fn
//! page_mut()` that the single writer reaches through its write
//! transaction. The transaction layer ties the returned slices to `&self` /
//! `&mut self` borrows, so within one transaction the borrow checker rules
//! out aliasing; across transactions the single-writer discipline and COW
//! keep writer and reader page sets disjoint.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::{
    GROWTH_FAST_WINDOW_SECS, GROWTH_SLOW_WINDOW_SECS, INITIAL_PAGE_COUNT, MAX_INCREASE_PAGES,
    MIN_INCREASE_PAGES,
};
use crate::errors::StoreError;

enum Backing {
    Heap { ptr: *mut u8, layout: Layout },
    Mmap { map: MmapMut },
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Heap { ptr, layout } = self {
            // SAFETY: ptr was returned by alloc_zeroed with this exact layout
            // and is deallocated exactly once, here.
            unsafe { dealloc(*ptr, *layout) };
        }
    }
}

/// One immutable-length snapshot of the mapped region. Reference-counted so
/// readers keep their mapping alive through a remap.
pub struct PagerState {
    base: *mut u8,
    len: usize,
    page_size: u32,
    _backing: Backing,
}

// SAFETY: the raw base pointer refers to a region owned by `_backing`, which
// lives exactly as long as this state. Shared access is read-only; mutable
// access goes through the unsafe `page_mut`, whose callers uphold the
// single-writer / COW discipline documented on it.
unsafe impl Send for PagerState {}
unsafe impl Sync for PagerState {}

impl PagerState {
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn num_pages(&self) -> u64 {
        (self.len / self.page_size as usize) as u64
    }

    pub fn page(&self, page_no: u64) -> Result<&[u8]> {
        let limit = self.num_pages();
        ensure!(
            page_no < limit,
            StoreError::OutOfBounds {
                page: page_no,
                limit
            }
        );

        let offset = page_no as usize * self.page_size as usize;
        // SAFETY: bounds checked above; the region is valid for `len` bytes
        // for the lifetime of self.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), self.page_size as usize) })
    }

    /// Mutable view of a page.
    ///
    /// # Safety
    ///
    /// The caller must be the single live writer and must not hold any other
    /// reference, shared or mutable, to this page. Writers only touch pages
    /// invisible to every reader snapshot (freshly allocated or COW copies).
    pub(crate) unsafe fn page_mut(&self, page_no: u64) -> Result<&mut [u8]> {
        let limit = self.num_pages();
        ensure!(
            page_no < limit,
            StoreError::OutOfBounds {
                page: page_no,
                limit
            }
        );

        let offset = page_no as usize * self.page_size as usize;
        Ok(std::slice::from_raw_parts_mut(
            self.base.add(offset),
            self.page_size as usize,
        ))
    }

    /// Copies a whole page. Writer-only, same contract as `page_mut`.
    pub(crate) unsafe fn copy_page(&self, src: u64, dst: u64) -> Result<()> {
        let limit = self.num_pages();
        ensure!(
            src < limit && dst < limit,
            StoreError::OutOfBounds {
                page: src.max(dst),
                limit
            }
        );
        ensure!(src != dst, "cannot copy page {} onto itself", src);

        let size = self.page_size as usize;
        std::ptr::copy_nonoverlapping(
            self.base.add(src as usize * size),
            self.base.add(dst as usize * size),
            size,
        );
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        match &self._backing {
            Backing::Heap { .. } => Ok(()),
            Backing::Mmap { map } => map
                .flush()
                .map_err(StoreError::Backing)
                .wrap_err("failed to sync mapped pages to disk"),
        }
    }
}

struct GrowthPolicy {
    increment: u64,
    last_grow: Option<Instant>,
    min_increase: u64,
    max_increase: u64,
}

impl GrowthPolicy {
    fn new(page_size: u32, min_increase: Option<u64>, max_increase: Option<u64>) -> Self {
        let min = min_increase.unwrap_or(MIN_INCREASE_PAGES * page_size as u64);
        let max = max_increase.unwrap_or(MAX_INCREASE_PAGES * page_size as u64);
        Self {
            increment: min,
            last_grow: None,
            min_increase: min,
            max_increase: max.max(min),
        }
    }

    fn next_length(&mut self, current_len: u64, required_len: u64, page_size: u32) -> u64 {
        let now = Instant::now();
        if let Some(prev) = self.last_grow {
            let elapsed = now.duration_since(prev);
            if elapsed < Duration::from_secs(GROWTH_FAST_WINDOW_SECS) {
                self.increment = (self.increment * 2).min(self.max_increase);
            } else if elapsed > Duration::from_secs(GROWTH_SLOW_WINDOW_SECS) {
                self.increment = (self.increment / 2).max(self.min_increase);
            }
        }
        self.last_grow = Some(now);

        let applied = self
            .increment
            .min(current_len / 4)
            .max(page_size as u64)
            .next_power_of_two();

        (current_len + applied).max(required_len)
    }
}

/// Page-granular storage over a growable backing region.
pub struct Pager {
    current: RwLock<Arc<PagerState>>,
    page_size: u32,
    file: Option<File>,
    growth: Mutex<GrowthPolicy>,
    disposed: AtomicBool,
}

impl Pager {
    /// Heap-backed pager for memory-only environments.
    pub fn memory(
        page_size: u32,
        min_increase: Option<u64>,
        max_increase: Option<u64>,
    ) -> Result<Self> {
        let len = INITIAL_PAGE_COUNT as usize * page_size as usize;
        let state = heap_state(len, page_size)?;

        Ok(Self {
            current: RwLock::new(Arc::new(state)),
            page_size,
            file: None,
            growth: Mutex::new(GrowthPolicy::new(page_size, min_increase, max_increase)),
            disposed: AtomicBool::new(false),
        })
    }

    /// File-backed pager. Creates the file when absent; returns whether it
    /// did, so the environment knows to initialize fresh headers.
    pub fn file<P: AsRef<Path>>(
        path: P,
        page_size: u32,
        min_increase: Option<u64>,
        max_increase: Option<u64>,
    ) -> Result<(Self, bool)> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(StoreError::Backing)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .map_err(StoreError::Backing)
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        let created = file_size == 0;
        if created {
            file.set_len(INITIAL_PAGE_COUNT * page_size as u64)
                .map_err(StoreError::Backing)
                .wrap_err("failed to size new store file")?;
        } else {
            ensure!(
                file_size % page_size as u64 == 0,
                StoreError::Corrupt(format!(
                    "store file '{}' size {} is not a multiple of page size {}",
                    path.display(),
                    file_size,
                    page_size
                ))
            );
        }

        let state = mmap_state(&file, page_size)?;

        Ok((
            Self {
                current: RwLock::new(Arc::new(state)),
                page_size,
                file: Some(file),
                growth: Mutex::new(GrowthPolicy::new(page_size, min_increase, max_increase)),
                disposed: AtomicBool::new(false),
            },
            created,
        ))
    }

    fn check_disposed(&self) -> Result<()> {
        ensure!(!self.disposed.load(Ordering::Acquire), StoreError::Disposed);
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Current snapshot handle. Readers keep the clone for their lifetime.
    pub fn state(&self) -> Arc<PagerState> {
        self.current.read().clone()
    }

    pub fn num_allocated_pages(&self) -> u64 {
        self.current.read().num_pages()
    }

    /// Makes sure pages `[requested_page, requested_page + n)` are mapped,
    /// growing the region if needed, and returns the (possibly new) current
    /// state.
    pub fn ensure_continuous(&self, requested_page: u64, n: u64) -> Result<Arc<PagerState>> {
        self.check_disposed()?;

        let required_pages = requested_page
            .checked_add(n)
            .ok_or_else(|| StoreError::InvalidData("page range overflows".into()))?;

        {
            let current = self.current.read();
            if required_pages <= current.num_pages() {
                return Ok(current.clone());
            }
        }

        let mut current = self.current.write();
        if required_pages <= current.num_pages() {
            return Ok(current.clone());
        }

        let required_len = required_pages * self.page_size as u64;
        let new_len =
            self.growth
                .lock()
                .next_length(current.len as u64, required_len, self.page_size);

        let new_state = match &self.file {
            None => {
                let state = heap_state(new_len as usize, self.page_size)?;
                // SAFETY: both regions are freshly valid for their lengths;
                // the destination was just allocated and has no other refs.
                unsafe {
                    std::ptr::copy_nonoverlapping(current.base, state.base, current.len);
                }
                state
            }
            Some(file) => {
                current.sync()?;
                file.set_len(new_len)
                    .map_err(StoreError::Backing)
                    .wrap_err_with(|| format!("failed to extend store file to {} bytes", new_len))?;
                mmap_state(file, self.page_size)?
            }
        };

        debug!(
            old_pages = current.num_pages(),
            new_pages = new_state.num_pages(),
            "pager.grow"
        );

        *current = Arc::new(new_state);
        Ok(current.clone())
    }

    /// Copies raw bytes into the region starting at the given page. Reserved
    /// for the committing writer (header slots and bootstrap pages).
    pub fn write_direct(&self, src: &[u8], page_pos: u64) -> Result<()> {
        self.check_disposed()?;

        let state = self.state();
        let offset = page_pos as usize * self.page_size as usize;
        ensure!(
            offset + src.len() <= state.len,
            StoreError::OutOfBounds {
                page: page_pos,
                limit: state.num_pages()
            }
        );

        // SAFETY: bounds checked; only the single writer calls this, and
        // only for pages no reader snapshot resolves.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), state.base.add(offset), src.len());
        }
        Ok(())
    }

    /// Flushes the backing region to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.check_disposed()?;
        self.current.read().sync()
    }

    /// Marks the pager unusable. Outstanding state handles stay readable;
    /// every pager operation afterwards fails with `Disposed`.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            let _ = self.current.read().sync();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Hints the OS to fault in a page range ahead of a sequential scan.
    pub fn prefetch(&self, start_page: u64, count: u64) {
        let state = self.state();
        let limit = state.num_pages();
        if start_page >= limit {
            return;
        }

        #[cfg(unix)]
        {
            let end = (start_page + count).min(limit);
            let offset = start_page as usize * self.page_size as usize;
            let len = (end - start_page) as usize * self.page_size as usize;
            // SAFETY: the range is bounds-checked against the mapping and
            // madvise is advisory only.
            unsafe {
                libc::madvise(
                    state.base.add(offset) as *mut libc::c_void,
                    len,
                    libc::MADV_WILLNEED,
                );
            }
        }
        #[cfg(not(unix))]
        {
            let _ = count;
        }
    }
}

fn heap_state(len: usize, page_size: u32) -> Result<PagerState> {
    let layout = Layout::from_size_align(len, page_size as usize)
        .map_err(|e| eyre::eyre!("bad heap layout for {} bytes: {}", len, e))?;

    // SAFETY: layout has non-zero size (INITIAL_PAGE_COUNT pages minimum).
    let ptr = unsafe { alloc_zeroed(layout) };
    ensure!(!ptr.is_null(), "failed to allocate {} byte heap region", len);

    Ok(PagerState {
        base: ptr,
        len,
        page_size,
        _backing: Backing::Heap { ptr, layout },
    })
}

fn mmap_state(file: &File, page_size: u32) -> Result<PagerState> {
    // SAFETY: the store file is opened read-write by this process alone;
    // the mapping's lifetime is tied to the PagerState that owns it, and
    // all access is bounds-checked through page()/page_mut().
    let mut map = unsafe {
        MmapMut::map_mut(file)
            .map_err(StoreError::Backing)
            .wrap_err("failed to memory-map store file")?
    };

    let base = map.as_mut_ptr();
    let len = map.len();

    Ok(PagerState {
        base,
        len,
        page_size,
        _backing: Backing::Mmap { map },
    })
}
