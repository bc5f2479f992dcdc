//! Physical page acquisition and release.
//!
//! Page-backed allocators obtain their memory as fixed-size pages from a
//! [`PageSource`]. The contract is all-or-nothing: an acquisition that
//! cannot fill every requested slot fails without side effects, so a
//! failed allocator creation never strands pages.
//!
//! [`FixedPagePool`] is the built-in source: one caller-provided region
//! divided into equal pages, with the free pages kept in a spinlocked
//! stack.

use arrayvec::ArrayVec;
use snafu::Snafu;
use spin::mutex::SpinMutex;

/// Upper bound on the number of pages a [`FixedPagePool`] manages.
pub const MAX_POOL_PAGES: usize = 64;

/// Page alignment guaranteed by [`FixedPagePool`]; matches the block
/// pool's region alignment so a page origin doubles as a pool handle.
pub const PAGE_ALIGN: usize = 32;

#[derive(Debug, Snafu)]
pub enum PageGrantError {
    #[snafu(display("page pool exhausted: {requested} pages requested, {available} free"))]
    Exhausted {
        requested: usize,
        available: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

#[derive(Debug, Snafu)]
pub enum PageReleaseError {
    #[snafu(display("pointer {addr:#x} is not a granted page origin of this pool"))]
    NotAPageOrigin {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Grants and revokes fixed-size physical pages.
///
/// Heap creation builds a block pool at each page origin, so pages
/// should be aligned for the pool ([`PAGE_ALIGN`] suffices for the
/// built-in backends). A misaligned grant is rejected as a creation
/// error, with the pages returned to the source.
pub trait PageSource: Sync {
    /// Size in bytes of every page this source grants.
    fn page_size(&self) -> usize;

    /// Fills every slot of `origins` with a granted page, or fails with
    /// no side effects (partial acquisition is total failure).
    ///
    /// # Safety
    ///
    /// Granted pages are exclusively owned by the caller until released;
    /// the caller must not fabricate or duplicate origin pointers.
    unsafe fn acquire(&self, origins: &mut [*mut u8]) -> Result<(), PageGrantError>;

    /// Takes every page in `origins` back. On failure ownership of all
    /// pages stays with the caller.
    ///
    /// # Safety
    ///
    /// Every pointer must be a page origin previously returned by
    /// [`acquire`](Self::acquire) on this source and not yet released,
    /// and the caller must not touch the pages afterwards.
    unsafe fn release(&self, origins: &[*mut u8]) -> Result<(), PageReleaseError>;
}

/// A page source over one contiguous region divided into equal pages.
///
/// The region is aligned up to [`PAGE_ALIGN`] and split into
/// `bytes / page_size` pages (capped at [`MAX_POOL_PAGES`]); free pages
/// live in a spinlocked stack, so grants and revocations are cheap and
/// safe under concurrent callers.
pub struct FixedPagePool {
    base: *mut u8,
    page_size: usize,
    page_count: usize,
    free: SpinMutex<ArrayVec<*mut u8, MAX_POOL_PAGES>>,
}

// The raw base pointer is only handed out through the PageSource contract;
// the free stack is behind its own lock.
unsafe impl Send for FixedPagePool {}
unsafe impl Sync for FixedPagePool {}

impl FixedPagePool {
    /// Creates a page pool over the given region.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero or not a multiple of [`PAGE_ALIGN`].
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `region..region + bytes` is valid, writable memory
    /// - the region is used by nothing but this pool and the pages it
    ///   grants, for the pool's whole lifetime
    pub unsafe fn new(region: *mut u8, bytes: usize, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be non-zero");
        assert!(
            page_size.is_multiple_of(PAGE_ALIGN),
            "page size must be a multiple of the page alignment"
        );

        let offset = region.align_offset(PAGE_ALIGN);
        let base = region.wrapping_add(offset);
        let page_count = (bytes.saturating_sub(offset) / page_size).min(MAX_POOL_PAGES);

        let mut free = ArrayVec::new();
        // Stack order: the lowest page is granted first.
        for index in (0..page_count).rev() {
            free.push(base.wrapping_add(index * page_size));
        }

        Self {
            base,
            page_size,
            page_count,
            free: SpinMutex::new(free),
        }
    }

    /// Number of pages currently available.
    pub fn free_pages(&self) -> usize {
        self.free.lock().len()
    }

    /// Total number of pages managed by this pool.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    fn is_page_origin(&self, ptr: *mut u8) -> bool {
        let Some(offset) = ptr.addr().checked_sub(self.base.addr()) else {
            return false;
        };
        offset.is_multiple_of(self.page_size) && offset / self.page_size < self.page_count
    }
}

impl PageSource for FixedPagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn acquire(&self, origins: &mut [*mut u8]) -> Result<(), PageGrantError> {
        let mut free = self.free.lock();
        if free.len() < origins.len() {
            log::debug!(
                "page pool: cannot grant {} pages, {} free",
                origins.len(),
                free.len()
            );
            return ExhaustedSnafu {
                requested: origins.len(),
                available: free.len(),
            }
            .fail();
        }

        for slot in origins.iter_mut() {
            *slot = free.pop().expect("length checked above");
        }
        Ok(())
    }

    unsafe fn release(&self, origins: &[*mut u8]) -> Result<(), PageReleaseError> {
        let mut free = self.free.lock();

        // Validate everything first so a failed release has no effect.
        for &ptr in origins {
            if !self.is_page_origin(ptr) || free.contains(&ptr) {
                return NotAPageOriginSnafu { addr: ptr.addr() }.fail();
            }
        }

        for &ptr in origins {
            free.push(ptr);
        }
        Ok(())
    }
}
