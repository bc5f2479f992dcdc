//! Seam to the fixed-pool block allocator backing each page.
//!
//! [`HeapAllocator`](crate::allocator::HeapAllocator) never manages blocks
//! itself; it turns every page (or the single pool region) into an
//! independent block pool through this trait and searches them in order.
//! The trait exists so tests can substitute a recording or failing pool;
//! production code uses [`MemPoolBackend`].

use core::ptr::NonNull;

use mem_pool::MemPool;

/// Contract of the underlying fixed-pool block allocator.
///
/// A pool is created inside a memory region and identified afterwards by
/// the opaque handle [`init`](Self::init) returns. Every allocated block
/// carries an implicit header from which its usable length can be
/// recovered with only the data pointer. `realloc` relies on that, since
/// the pool offers no growth in place.
pub trait BlockPool {
    /// Per-allocation bookkeeping charge used for capacity planning.
    const BLOCK_OVERHEAD: usize;

    /// Builds a pool over `region`, returning its handle, or `None` when
    /// the region is too small.
    ///
    /// # Safety
    ///
    /// `region..region + bytes` must be valid, exclusively owned memory
    /// that stays untouched (except through this pool) while the pool is
    /// in use.
    unsafe fn init(region: *mut u8, bytes: usize) -> Option<NonNull<u8>>;

    /// Allocates `size` bytes from the pool, or `None` when it has no
    /// space.
    ///
    /// # Safety
    ///
    /// `pool` must come from [`init`](Self::init); access must be
    /// externally serialized.
    unsafe fn alloc(pool: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the pool; `false` when the pool does not
    /// recognize `ptr`.
    ///
    /// # Safety
    ///
    /// `pool` must come from [`init`](Self::init); access must be
    /// externally serialized.
    unsafe fn free(pool: NonNull<u8>, ptr: *mut u8) -> bool;

    /// Reads the usable length of a live allocation from its implicit
    /// header.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of a pool created through this
    /// backend.
    unsafe fn block_len(ptr: NonNull<u8>) -> usize;
}

/// Default backend forwarding to [`mem_pool::MemPool`].
#[derive(Debug)]
pub struct MemPoolBackend;

impl BlockPool for MemPoolBackend {
    const BLOCK_OVERHEAD: usize = MemPool::BLOCK_OVERHEAD;

    unsafe fn init(region: *mut u8, bytes: usize) -> Option<NonNull<u8>> {
        unsafe { MemPool::init(region, bytes).map(NonNull::cast) }
    }

    unsafe fn alloc(pool: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        unsafe { MemPool::alloc(pool.cast(), size) }
    }

    unsafe fn free(pool: NonNull<u8>, ptr: *mut u8) -> bool {
        unsafe { MemPool::free(pool.cast(), ptr) }
    }

    unsafe fn block_len(ptr: NonNull<u8>) -> usize {
        unsafe { MemPool::block_len(ptr) }
    }
}
