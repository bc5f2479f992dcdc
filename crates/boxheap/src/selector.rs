//! Per-box heap selection.
//!
//! A [`BoxContext`] decides which [`HeapAllocator`] backs "the heap" for
//! the box it belongs to. A box may install a private heap with
//! [`set_allocator`](BoxContext::set_allocator); until it does, allocation
//! falls back to the box's process heap, which is turned into a
//! pool-backed allocator lazily on first use, so box creation never pays
//! for a heap the box might not touch.
//!
//! # Locking
//!
//! A private heap is only ever driven by its own box, so operations on it
//! take no lock. The process heap is shared between the box's threads, so
//! [`HeapRef`]s resolving to it hold the context's heap lock for as long
//! as they live. The lock exists from construction; resolution never
//! races on creating it.

use snafu::{ResultExt as _, Snafu};
use spin::{
    Once,
    mutex::{SpinMutex, SpinMutexGuard},
};

use crate::{
    allocator::{CreateError, HeapAllocator},
    pool::{BlockPool, MemPoolBackend},
};

#[derive(Debug, Snafu)]
pub enum ActiveHeapError {
    #[snafu(display("no active heap and no process heap region to fall back to"))]
    NoProcessHeap {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("process heap region cannot back an allocator"))]
    ProcessHeapUnusable {
        source: CreateError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Heap-selection state of one box.
pub struct BoxContext<P: BlockPool = MemPoolBackend> {
    process_region: *mut u8,
    process_region_size: usize,
    /// Allocator lazily built over the process region, at most once.
    process_pool: Once<HeapAllocator<P>>,
    /// Heap installed by the box, if any.
    active: SpinMutex<Option<HeapAllocator<P>>>,
    /// Serializes operations on the shared process heap.
    heap_lock: SpinMutex<()>,
}

// The process region is exclusively owned by this context, and every
// other field is behind a lock or a Once.
unsafe impl<P: BlockPool> Send for BoxContext<P> {}
unsafe impl<P: BlockPool> Sync for BoxContext<P> {}

/// A resolved heap, holding the process-heap lock when it must.
///
/// Operations go through [`heap`](Self::heap) while the ref is alive; the
/// lock (if any) drops with the ref.
pub struct HeapRef<'a, P: BlockPool = MemPoolBackend> {
    heap: HeapAllocator<P>,
    _guard: Option<SpinMutexGuard<'a, ()>>,
}

impl<P: BlockPool> HeapRef<'_, P> {
    /// The resolved heap handle.
    #[must_use]
    pub fn heap(&self) -> HeapAllocator<P> {
        self.heap
    }
}

impl<P: BlockPool> BoxContext<P> {
    /// Creates the context for a box whose process heap is `region`.
    ///
    /// A null `region` (or zero `bytes`) means the box has no process
    /// heap; allocation then fails with
    /// [`ActiveHeapError::NoProcessHeap`] until a heap is installed.
    ///
    /// # Safety
    ///
    /// A non-null `region..region + bytes` must be valid, writable memory
    /// owned by this context alone for its whole lifetime.
    #[must_use]
    pub const unsafe fn new(region: *mut u8, bytes: usize) -> Self {
        Self {
            process_region: region,
            process_region_size: bytes,
            process_pool: Once::new(),
            active: SpinMutex::new(None),
            heap_lock: SpinMutex::new(()),
        }
    }

    /// Installs `heap` as the box's active heap.
    ///
    /// Subsequent allocation goes to `heap` instead of the process heap.
    pub fn set_allocator(&self, heap: HeapAllocator<P>) {
        *self.active.lock() = Some(heap);
        log::debug!("active heap set to {heap:?}");
    }

    /// The heap allocation currently resolves to.
    ///
    /// Returns the installed heap if any; otherwise initializes the
    /// process heap (at most once, even under concurrent callers) and
    /// returns it. A failed initialization is retried on the next call.
    pub fn get_allocator(&self) -> Result<HeapAllocator<P>, ActiveHeapError> {
        if let Some(heap) = *self.active.lock() {
            return Ok(heap);
        }
        self.process_pool()
    }

    /// Resolves the heap for an allocation call.
    ///
    /// The returned ref holds the heap lock exactly when the resolved
    /// heap is the shared process heap.
    pub fn active_heap(&self) -> Result<HeapRef<'_, P>, ActiveHeapError> {
        let heap = self.get_allocator()?;
        let guard = (self.process_pool.get() == Some(&heap)).then(|| self.heap_lock.lock());
        Ok(HeapRef {
            heap,
            _guard: guard,
        })
    }

    /// Resolves the process heap explicitly, initializing it if needed.
    ///
    /// Always locks: the process heap is shared regardless of which heap
    /// is active.
    pub fn process_heap(&self) -> Result<HeapRef<'_, P>, ActiveHeapError> {
        let heap = self.process_pool()?;
        Ok(HeapRef {
            heap,
            _guard: Some(self.heap_lock.lock()),
        })
    }

    fn process_pool(&self) -> Result<HeapAllocator<P>, ActiveHeapError> {
        self.process_pool
            .try_call_once(|| {
                if self.process_region.is_null() || self.process_region_size == 0 {
                    return NoProcessHeapSnafu.fail();
                }
                log::debug!(
                    "initializing process heap over {} bytes at {:p}",
                    self.process_region_size,
                    self.process_region
                );
                unsafe {
                    HeapAllocator::create_with_pool(self.process_region, self.process_region_size)
                }
                .context(ProcessHeapUnusableSnafu)
            })
            .copied()
    }
}
