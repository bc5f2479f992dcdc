//! One logical heap spanning a caller-owned region or granted pages.
//!
//! A [`HeapAllocator`] is a thin handle over a page table. The table
//! records how the heap is backed and holds one block-pool handle per
//! page; allocation is a first-fit scan over those pools in page order,
//! so earlier pages fill up before later ones and a freed early page is
//! reused first.
//!
//! Two backings exist:
//!
//! - **pool-backed**: the table and the single pool both live inside a
//!   region the caller already owns. Nothing is allocated, nothing can
//!   be destroyed.
//! - **page-backed**: pages come from a [`PageSource`] and the table
//!   from the global allocator; [`destroy`](HeapAllocator::destroy)
//!   returns both.
//!
//! Handles are `Copy` and compare by identity. All operations require
//! external serialization; see [`BoxContext`](crate::selector::BoxContext)
//! for the locking policy.

use core::{
    alloc::Layout,
    marker::PhantomData,
    ptr::{self, NonNull},
};

use snafu::{ResultExt as _, Snafu};

use crate::{
    page_source::{PageGrantError, PageReleaseError, PageSource},
    pool::{BlockPool, MemPoolBackend},
};

#[derive(Debug, Snafu)]
pub enum CreateError {
    #[snafu(display("region of {bytes} bytes cannot hold the heap metadata and a minimal pool"))]
    PoolTooSmall {
        bytes: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display(
        "largest allowed request of {max_malloc_size} bytes does not fit a \
         {page_size}-byte page"
    ))]
    RequestExceedsPage {
        max_malloc_size: usize,
        page_size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("failed to allocate the page table for {page_count} pages"))]
    TableExhausted {
        page_count: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("failed to acquire heap pages"))]
    PageGrant {
        source: PageGrantError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("a {page_size}-byte page is too small for a block pool"))]
    PageTooSmall {
        page_size: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("granted page at {addr:#x} cannot anchor a block pool"))]
    PageMisaligned {
        addr: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

#[derive(Debug, Snafu)]
pub enum DestroyError {
    #[snafu(display("pool-backed heaps live in caller-owned memory and cannot be destroyed"))]
    NotPageBacked {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("failed to release heap pages"))]
    PageRelease {
        source: PageReleaseError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// How a heap obtained its memory.
#[derive(Clone, Copy)]
enum Backing {
    /// Caller-owned region; the table is embedded in it.
    Pool,
    /// Pages granted by `source`; the table is heap-allocated.
    Pages { source: &'static dyn PageSource },
}

/// Heap metadata, followed in memory by `page_count` pool handles
/// (one per page, in ascending page order).
struct PageTable {
    backing: Backing,
    /// Bytes per page; for a pool-backed heap, the pool region size.
    page_size: usize,
    page_count: usize,
}

/// Handle to one logical heap.
///
/// Generic over the block pool backend so tests can substitute one;
/// production code uses the default.
pub struct HeapAllocator<P: BlockPool = MemPoolBackend> {
    table: NonNull<PageTable>,
    _backend: PhantomData<P>,
}

impl<P: BlockPool> Clone for HeapAllocator<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: BlockPool> Copy for HeapAllocator<P> {}

impl<P: BlockPool> PartialEq for HeapAllocator<P> {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table
    }
}
impl<P: BlockPool> Eq for HeapAllocator<P> {}

impl<P: BlockPool> core::fmt::Debug for HeapAllocator<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("table", &self.table)
            .finish()
    }
}

// The handle is an identity; all mutating operations are unsafe and
// require the caller to serialize access.
unsafe impl<P: BlockPool> Send for HeapAllocator<P> {}
unsafe impl<P: BlockPool> Sync for HeapAllocator<P> {}

impl<P: BlockPool> HeapAllocator<P> {
    /// Creates a heap inside a region the caller already owns.
    ///
    /// The page table is placed at the start of the region and the rest
    /// becomes a single block pool, so the heap needs no allocation of
    /// its own. That is what makes lazy process-heap setup possible
    /// before any allocator exists.
    ///
    /// # Safety
    ///
    /// `region..region + bytes` must be valid, writable memory owned by
    /// this heap alone for as long as the handle is used.
    pub unsafe fn create_with_pool(region: *mut u8, bytes: usize) -> Result<Self, CreateError> {
        let Some(layout) = table_layout(1) else {
            return PoolTooSmallSnafu { bytes }.fail();
        };
        let offset = region.align_offset(layout.align());
        let meta_end = offset + layout.size();
        if bytes <= meta_end {
            return PoolTooSmallSnafu { bytes }.fail();
        }

        unsafe {
            let pool_bytes = bytes - meta_end;
            let Some(pool) = P::init(region.add(meta_end), pool_bytes) else {
                return PoolTooSmallSnafu { bytes }.fail();
            };

            let table = region.add(offset).cast::<PageTable>();
            table.write(PageTable {
                backing: Backing::Pool,
                page_size: pool_bytes,
                page_count: 1,
            });
            *origins(table) = pool.as_ptr();

            log::debug!("pool-backed heap at {table:p}, {pool_bytes} usable bytes");
            Ok(Self {
                table: NonNull::new_unchecked(table),
                _backend: PhantomData,
            })
        }
    }

    /// Creates a heap of at least `size` usable bytes backed by pages.
    ///
    /// Every allocation must fit inside one page; the `max_malloc_size`
    /// bound is validated here once, against the source's page size
    /// less the pool's per-block overhead. Page acquisition is
    /// all-or-nothing: on any failure the source is left exactly as it
    /// was.
    pub fn create_with_pages(
        source: &'static dyn PageSource,
        size: usize,
        max_malloc_size: usize,
    ) -> Result<Self, CreateError> {
        let page_size = source.page_size();
        let usable_per_page = page_size.saturating_sub(P::BLOCK_OVERHEAD);
        if usable_per_page == 0 || max_malloc_size > usable_per_page {
            return RequestExceedsPageSnafu {
                max_malloc_size,
                page_size,
            }
            .fail();
        }

        // Each page crossed charges the per-block overhead once, since a
        // request straddling pages becomes separate blocks.
        let mut request = size.max(1);
        let mut page_count = 0_usize;
        loop {
            request = match request.checked_add(P::BLOCK_OVERHEAD) {
                Some(request) => request,
                None => return TableExhaustedSnafu { page_count }.fail(),
            };
            page_count += 1;
            if request <= page_size {
                break;
            }
            request -= page_size;
        }

        let Some(layout) = table_layout(page_count) else {
            return TableExhaustedSnafu { page_count }.fail();
        };
        unsafe {
            let table = alloc::alloc::alloc(layout).cast::<PageTable>();
            if table.is_null() {
                return TableExhaustedSnafu { page_count }.fail();
            }
            table.write(PageTable {
                backing: Backing::Pages { source },
                page_size,
                page_count,
            });

            let slots = core::slice::from_raw_parts_mut(origins(table), page_count);
            slots.fill(ptr::null_mut());
            if let Err(err) = source.acquire(slots) {
                alloc::alloc::dealloc(table.cast(), layout);
                return Err(err).context(PageGrantSnafu);
            }

            // The pool handle must coincide with the page origin so the
            // slot stays a valid origin for release; a page below the
            // pool's region alignment shifts the handle.
            let mut failure = None;
            for &slot in slots.iter() {
                match P::init(slot, page_size) {
                    Some(pool) if ptr::eq(pool.as_ptr(), slot) => {}
                    Some(_) => {
                        failure = Some(PageMisalignedSnafu { addr: slot.addr() }.build());
                        break;
                    }
                    None => {
                        failure = Some(PageTooSmallSnafu { page_size }.build());
                        break;
                    }
                }
            }
            if let Some(failure) = failure {
                if let Err(err) = source.release(slots) {
                    log::error!("leaking pages of a half-built heap: {err}");
                }
                alloc::alloc::dealloc(table.cast(), layout);
                return Err(failure);
            }

            log::debug!("page-backed heap at {table:p}, {page_count} pages of {page_size} bytes");
            Ok(Self {
                table: NonNull::new_unchecked(table),
                _backend: PhantomData,
            })
        }
    }

    /// Tears a page-backed heap down, returning its pages to the source.
    ///
    /// Pool-backed heaps are rejected: their memory belongs to the
    /// caller. If the source refuses the pages, the table is kept so the
    /// pages remain reachable, and the error is surfaced.
    ///
    /// # Safety
    ///
    /// The heap must have no live allocations, and no other copy of this
    /// handle may be used afterwards.
    pub unsafe fn destroy(self) -> Result<(), DestroyError> {
        unsafe {
            let table = self.table.as_ptr();
            let Backing::Pages { source } = (*table).backing else {
                return NotPageBackedSnafu.fail();
            };

            let page_count = (*table).page_count;
            let slots = core::slice::from_raw_parts(origins(table).cast_const(), page_count);
            source.release(slots).context(PageReleaseSnafu)?;

            // Creation computed this same layout successfully.
            let Some(layout) = table_layout(page_count) else {
                unreachable!()
            };
            alloc::alloc::dealloc(table.cast(), layout);
            log::debug!("destroyed page-backed heap, {page_count} pages returned");
            Ok(())
        }
    }

    /// Allocates `size` bytes, scanning pages first-fit in page order.
    ///
    /// # Safety
    ///
    /// The handle must be live and access externally serialized.
    pub unsafe fn malloc(self, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let table = self.table.as_ptr();
            for index in 0..(*table).page_count {
                let pool = NonNull::new_unchecked(*origins(table).add(index));
                if let Some(ptr) = P::alloc(pool, size) {
                    return Some(ptr);
                }
            }
            log::trace!("heap {:p}: no page can serve {size} bytes", self.table);
            None
        }
    }

    /// Returns a block to whichever page owns it.
    ///
    /// `false` means no page recognized the pointer; the heap is
    /// untouched in that case.
    ///
    /// # Safety
    ///
    /// The handle must be live and access externally serialized.
    pub unsafe fn free(self, ptr: *mut u8) -> bool {
        unsafe {
            let table = self.table.as_ptr();
            for index in 0..(*table).page_count {
                let pool = NonNull::new_unchecked(*origins(table).add(index));
                if P::free(pool, ptr) {
                    return true;
                }
            }
            log::warn!("heap {:p}: free of unknown pointer {ptr:p}", self.table);
            false
        }
    }

    /// Resizes a block by allocate-copy-free.
    ///
    /// The pool offers no growth in place, so a new block is always
    /// allocated and `min(old, new)` bytes are copied. On allocation
    /// failure the old block is left intact and `None` is returned. A
    /// null `ptr` behaves as [`malloc`](Self::malloc).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this heap; the handle
    /// must be live and access externally serialized.
    pub unsafe fn realloc(self, ptr: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let Some(old) = NonNull::new(ptr) else {
                return self.malloc(new_size);
            };

            let new = self.malloc(new_size)?;
            let old_len = P::block_len(old);
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_len.min(new_size));
            if !self.free(old.as_ptr()) {
                log::warn!("heap {:p}: realloc source {old:p} was not ours", self.table);
            }
            Some(new)
        }
    }

    /// Number of pages backing this heap (1 for pool-backed).
    ///
    /// # Safety
    ///
    /// The handle must be live.
    #[must_use]
    pub unsafe fn page_count(self) -> usize {
        unsafe { (*self.table.as_ptr()).page_count }
    }

    /// Bytes per page; for a pool-backed heap, the pool region size.
    ///
    /// # Safety
    ///
    /// The handle must be live.
    #[must_use]
    pub unsafe fn page_size(self) -> usize {
        unsafe { (*self.table.as_ptr()).page_size }
    }

    /// Whether this heap owns pages that `destroy` would return.
    ///
    /// # Safety
    ///
    /// The handle must be live.
    #[must_use]
    pub unsafe fn is_page_backed(self) -> bool {
        unsafe { matches!((*self.table.as_ptr()).backing, Backing::Pages { .. }) }
    }
}

/// Start of the pool-handle array trailing the table.
///
/// `PageTable` is pointer-aligned with a size that is a multiple of its
/// alignment, so the array begins directly after it.
fn origins(table: *mut PageTable) -> *mut *mut u8 {
    table.wrapping_add(1).cast()
}

fn table_layout(page_count: usize) -> Option<Layout> {
    let (layout, offset) = Layout::new::<PageTable>()
        .extend(Layout::array::<*mut u8>(page_count).ok()?)
        .ok()?;
    debug_assert_eq!(offset, size_of::<PageTable>());
    Some(layout.pad_to_align())
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec::Vec};
    use core::ptr;

    use mem_pool::MemPool;

    use super::*;
    use crate::page_source::{FixedPagePool, PAGE_ALIGN};

    type Heap = HeapAllocator<MemPoolBackend>;

    fn with_test_region<F>(bytes: usize, test_fn: F)
    where
        F: FnOnce(*mut u8, usize),
    {
        unsafe {
            let layout = Layout::from_size_align(bytes, PAGE_ALIGN).unwrap();
            let region = alloc::alloc::alloc(layout);
            region.write_bytes(0x11, bytes);
            test_fn(region, bytes);
            alloc::alloc::dealloc(region, layout);
        }
    }

    fn leak_source(bytes: usize, page_size: usize) -> &'static FixedPagePool {
        unsafe {
            let layout = Layout::from_size_align(bytes, PAGE_ALIGN).unwrap();
            let region = alloc::alloc::alloc(layout);
            Box::leak(Box::new(FixedPagePool::new(region, bytes, page_size)))
        }
    }

    #[test]
    fn test_pool_backed_basic() {
        with_test_region(1024, |region, bytes| unsafe {
            let heap = Heap::create_with_pool(region, bytes).unwrap();
            assert_eq!(heap.page_count(), 1);
            assert!(!heap.is_page_backed());

            let ptr = heap.malloc(64).unwrap();
            ptr.as_ptr().write_bytes(0x5a, 64);
            assert!(heap.free(ptr.as_ptr()));

            assert!(matches!(heap.destroy(), Err(DestroyError::NotPageBacked { .. })));
        });
    }

    #[test]
    fn test_pool_backed_exhaustion_and_reuse() {
        // 320 bytes: table metadata plus a 256-byte pool, which holds
        // exactly two 64-byte blocks.
        with_test_region(320, |region, bytes| unsafe {
            let heap = Heap::create_with_pool(region, bytes).unwrap();
            let a = heap.malloc(64).unwrap();
            let b = heap.malloc(64).unwrap();
            assert!(heap.malloc(64).is_none());

            assert!(heap.free(a.as_ptr()));
            let c = heap.malloc(64).unwrap();
            assert_eq!(c, a);
            assert!(heap.free(b.as_ptr()));
            assert!(heap.free(c.as_ptr()));
        });
    }

    #[test]
    fn test_pool_backed_rejects_tiny_region() {
        with_test_region(64, |region, bytes| unsafe {
            assert!(matches!(
                Heap::create_with_pool(region, bytes),
                Err(CreateError::PoolTooSmall { .. })
            ));
        });
    }

    #[test]
    fn test_page_count_charges_overhead_per_page() {
        let source = leak_source(8192, 1024);
        // 3000 bytes with 32 bytes charged per page crossed needs 4 pages.
        let heap = Heap::create_with_pages(source, 3000, 900).unwrap();
        unsafe {
            assert_eq!(heap.page_count(), 4);
            assert_eq!(heap.page_size(), 1024);
            assert_eq!(source.free_pages(), 4);
            heap.destroy().unwrap();
        }
        assert_eq!(source.free_pages(), 8);
    }

    #[test]
    fn test_zero_size_heap_gets_one_page() {
        let source = leak_source(4096, 1024);
        let heap = Heap::create_with_pages(source, 0, 128).unwrap();
        unsafe {
            assert_eq!(heap.page_count(), 1);
            heap.destroy().unwrap();
        }
    }

    #[test]
    fn test_max_malloc_must_fit_one_page() {
        let source = leak_source(4096, 1024);
        assert!(matches!(
            Heap::create_with_pages(source, 2048, 1024 - MemPool::BLOCK_OVERHEAD + 1),
            Err(CreateError::RequestExceedsPage { .. })
        ));
        assert!(Heap::create_with_pages(source, 2048, 1024 - MemPool::BLOCK_OVERHEAD).is_ok());
    }

    /// Source whose pages sit 8 bytes past the pool's region alignment.
    struct OffsetSource {
        inner: FixedPagePool,
    }

    impl PageSource for OffsetSource {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }

        unsafe fn acquire(&self, origins: &mut [*mut u8]) -> Result<(), PageGrantError> {
            unsafe { self.inner.acquire(origins) }?;
            for origin in origins.iter_mut() {
                *origin = origin.wrapping_add(8);
            }
            Ok(())
        }

        unsafe fn release(&self, origins: &[*mut u8]) -> Result<(), PageReleaseError> {
            let shifted: Vec<*mut u8> = origins.iter().map(|p| p.wrapping_sub(8)).collect();
            unsafe { self.inner.release(&shifted) }
        }
    }

    #[test]
    fn test_misaligned_pages_are_an_error_not_a_panic() {
        let source: &'static OffsetSource = unsafe {
            let layout = Layout::from_size_align(4096, PAGE_ALIGN).unwrap();
            let region = alloc::alloc::alloc(layout);
            Box::leak(Box::new(OffsetSource {
                inner: FixedPagePool::new(region, 4096, 1024),
            }))
        };
        assert!(matches!(
            Heap::create_with_pages(source, 900, 512),
            Err(CreateError::PageMisaligned { .. })
        ));
        // The grant was rolled back.
        assert_eq!(source.inner.free_pages(), 4);
    }

    #[test]
    fn test_absurd_size_fails_cleanly() {
        let source = leak_source(4096, 1024);
        assert!(matches!(
            Heap::create_with_pages(source, usize::MAX - 16, 512),
            Err(CreateError::TableExhausted { .. })
        ));
        assert_eq!(source.free_pages(), 4);
    }

    #[test]
    fn test_grant_failure_strands_nothing() {
        let source = leak_source(2048, 1024);
        assert_eq!(source.free_pages(), 2);
        assert!(matches!(
            Heap::create_with_pages(source, 3000, 900),
            Err(CreateError::PageGrant { .. })
        ));
        assert_eq!(source.free_pages(), 2);
    }

    #[test]
    fn test_first_fit_in_page_order() {
        let source = leak_source(4096, 1024);
        let heap = Heap::create_with_pages(source, 1800, 512).unwrap();
        unsafe {
            assert_eq!(heap.page_count(), 2);

            // A 1024-byte page holds one 512-byte block, so the second
            // allocation spills into the second page; pages are granted
            // lowest-address first and adjacent, hence the exact stride.
            let a = heap.malloc(512).unwrap();
            let b = heap.malloc(512).unwrap();
            assert_eq!(b.as_ptr().addr() - a.as_ptr().addr(), 1024);

            // Freeing in the first page moves allocation back there.
            assert!(heap.free(a.as_ptr()));
            let again = heap.malloc(512).unwrap();
            assert_eq!(again, a);

            assert!(heap.free(again.as_ptr()));
            assert!(heap.free(b.as_ptr()));
            heap.destroy().unwrap();
        }
    }

    #[test]
    fn test_request_larger_than_page_fails() {
        let source = leak_source(4096, 256);
        let heap = Heap::create_with_pages(source, 600, 128).unwrap();
        unsafe {
            assert!(heap.page_count() >= 3);
            // Total capacity exceeds 224 bytes, but no single page holds it.
            assert!(heap.malloc(224).is_none());
            assert!(heap.malloc(128).is_some());
            heap.destroy().unwrap();
        }
    }

    #[test]
    fn test_free_rejects_foreign_pointer() {
        with_test_region(512, |region, bytes| unsafe {
            let heap = Heap::create_with_pool(region, bytes).unwrap();
            let mut outside = [0u8; 32];
            assert!(!heap.free(outside.as_mut_ptr()));
            assert!(!heap.free(ptr::null_mut()));
        });
    }

    #[test]
    fn test_realloc_preserves_data() {
        with_test_region(1024, |region, bytes| unsafe {
            let heap = Heap::create_with_pool(region, bytes).unwrap();

            let ptr = heap.realloc(ptr::null_mut(), 32).unwrap();
            for i in 0..32 {
                ptr.as_ptr().add(i).write(i as u8);
            }

            let grown = heap.realloc(ptr.as_ptr(), 128).unwrap();
            for i in 0..32 {
                assert_eq!(grown.as_ptr().add(i).read(), i as u8);
            }

            let shrunk = heap.realloc(grown.as_ptr(), 16).unwrap();
            for i in 0..16 {
                assert_eq!(shrunk.as_ptr().add(i).read(), i as u8);
            }
            assert!(heap.free(shrunk.as_ptr()));
        });
    }

    #[test]
    fn test_realloc_across_size_extremes() {
        with_test_region(4096, |region, bytes| unsafe {
            let heap = Heap::create_with_pool(region, bytes).unwrap();

            // Walk through boundary sizes; each step must preserve the
            // common prefix of the old and new lengths.
            let sizes = [0_usize, 1, 16, 1023, 1025, 16, 0];
            let mut ptr = heap.malloc(sizes[0]).unwrap();
            let mut len = sizes[0];

            for &next in &sizes[1..] {
                let moved = heap.realloc(ptr.as_ptr(), next).unwrap();
                let kept = len.min(next);
                for i in 0..kept {
                    assert_eq!(moved.as_ptr().add(i).read(), i as u8);
                }
                // Extend the pattern over the full new length.
                for i in 0..next {
                    moved.as_ptr().add(i).write(i as u8);
                }
                ptr = moved;
                len = next;
            }
            assert!(heap.free(ptr.as_ptr()));
        });
    }

    #[test]
    fn test_realloc_failure_leaves_block_intact() {
        with_test_region(320, |region, bytes| unsafe {
            let heap = Heap::create_with_pool(region, bytes).unwrap();
            let ptr = heap.malloc(64).unwrap();
            ptr.as_ptr().write_bytes(0x7e, 64);

            assert!(heap.realloc(ptr.as_ptr(), 4096).is_none());
            for i in 0..64 {
                assert_eq!(ptr.as_ptr().add(i).read(), 0x7e);
            }
            assert!(heap.free(ptr.as_ptr()));
        });
    }

    #[test]
    fn test_heaps_from_one_source_are_disjoint() {
        let source = leak_source(4096, 1024);
        let first = Heap::create_with_pages(source, 900, 512).unwrap();
        let second = Heap::create_with_pages(source, 900, 512).unwrap();
        assert_ne!(first, second);
        unsafe {
            let a = first.malloc(256).unwrap();
            let b = second.malloc(256).unwrap();
            // Each heap only recognizes its own blocks.
            assert!(!first.free(b.as_ptr()));
            assert!(!second.free(a.as_ptr()));
            assert!(first.free(a.as_ptr()));
            assert!(second.free(b.as_ptr()));
            first.destroy().unwrap();
            second.destroy().unwrap();
        }
    }
}
