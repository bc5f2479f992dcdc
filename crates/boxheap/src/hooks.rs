//! Runtime allocation entry points.
//!
//! The monitor redirects the runtime's `malloc`, `realloc` and `free` to
//! [`box_malloc`], [`box_realloc`] and [`box_free`]: thin adapters that
//! resolve the calling box's heap through its [`BoxContext`] and forward.
//! Failures surface the C way, as a null pointer, with the cause logged.
//!
//! The `_p` variants pin the operation to the box's process heap even
//! while a private heap is active, for data that must outlive a private
//! heap's teardown.
//!
//! [`RuntimeHeap`] wraps the same resolution as a
//! [`GlobalAlloc`](core::alloc::GlobalAlloc) so Rust code inside a box
//! can allocate through it directly.

use core::{
    alloc::{GlobalAlloc, Layout},
    marker::PhantomData,
    ptr::{self, NonNull},
};

use crate::{pool::BlockPool, selector::BoxContext};

/// Allocates from the calling box's active heap.
///
/// Returns null when no heap can be resolved or the heap is full.
pub fn box_malloc<P: BlockPool>(ctx: &BoxContext<P>, size: usize) -> *mut u8 {
    match ctx.active_heap() {
        Ok(heap) => unsafe { heap.heap().malloc(size) }.map_or(ptr::null_mut(), NonNull::as_ptr),
        Err(err) => {
            log::debug!("malloc({size}) without a usable heap: {err}");
            ptr::null_mut()
        }
    }
}

/// Resizes a block on the calling box's active heap.
///
/// Null `ptr` behaves as [`box_malloc`]. Returns null on failure, leaving
/// the old block intact.
///
/// # Safety
///
/// `ptr` must be null or a live allocation of the heap the context
/// currently resolves to, and must not be used after a successful call.
pub unsafe fn box_realloc<P: BlockPool>(ctx: &BoxContext<P>, ptr: *mut u8, size: usize) -> *mut u8 {
    match ctx.active_heap() {
        Ok(heap) => {
            unsafe { heap.heap().realloc(ptr, size) }.map_or(ptr::null_mut(), NonNull::as_ptr)
        }
        Err(err) => {
            log::debug!("realloc({ptr:p}, {size}) without a usable heap: {err}");
            ptr::null_mut()
        }
    }
}

/// Frees a block on the calling box's active heap. Null is a no-op.
///
/// # Safety
///
/// A non-null `ptr` must be a live allocation of the heap the context
/// currently resolves to, and must not be used afterwards.
pub unsafe fn box_free<P: BlockPool>(ctx: &BoxContext<P>, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match ctx.active_heap() {
        Ok(heap) => {
            unsafe { heap.heap().free(ptr) };
        }
        Err(err) => log::warn!("free({ptr:p}) without a usable heap, leaking: {err}"),
    }
}

/// [`box_malloc`] pinned to the box's process heap.
pub fn box_malloc_p<P: BlockPool>(ctx: &BoxContext<P>, size: usize) -> *mut u8 {
    match ctx.process_heap() {
        Ok(heap) => unsafe { heap.heap().malloc(size) }.map_or(ptr::null_mut(), NonNull::as_ptr),
        Err(err) => {
            log::debug!("malloc_p({size}) without a process heap: {err}");
            ptr::null_mut()
        }
    }
}

/// [`box_realloc`] pinned to the box's process heap.
///
/// # Safety
///
/// `ptr` must be null or a live allocation of the box's process heap, and
/// must not be used after a successful call.
pub unsafe fn box_realloc_p<P: BlockPool>(
    ctx: &BoxContext<P>,
    ptr: *mut u8,
    size: usize,
) -> *mut u8 {
    match ctx.process_heap() {
        Ok(heap) => {
            unsafe { heap.heap().realloc(ptr, size) }.map_or(ptr::null_mut(), NonNull::as_ptr)
        }
        Err(err) => {
            log::debug!("realloc_p({ptr:p}, {size}) without a process heap: {err}");
            ptr::null_mut()
        }
    }
}

/// [`box_free`] pinned to the box's process heap. Null is a no-op.
///
/// # Safety
///
/// A non-null `ptr` must be a live allocation of the box's process heap,
/// and must not be used afterwards.
pub unsafe fn box_free_p<P: BlockPool>(ctx: &BoxContext<P>, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match ctx.process_heap() {
        Ok(heap) => {
            unsafe { heap.heap().free(ptr) };
        }
        Err(err) => log::warn!("free_p({ptr:p}) without a process heap, leaking: {err}"),
    }
}

/// Supplies the context of the box currently executing.
///
/// The monitor implements this over its scheduling state; `None` means no
/// box is active, so allocation fails.
pub trait CurrentBox {
    fn current() -> Option<&'static BoxContext>;
}

/// Global allocator routing through the current box's heap.
///
/// The underlying pools hand out 16-byte-aligned blocks; requests for
/// stricter alignment are refused with null rather than served
/// misaligned.
pub struct RuntimeHeap<C> {
    _current: PhantomData<C>,
}

impl<C> RuntimeHeap<C> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _current: PhantomData,
        }
    }
}

impl<C> Default for RuntimeHeap<C> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<C: CurrentBox> GlobalAlloc for RuntimeHeap<C> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > mem_pool::UNIT {
            return ptr::null_mut();
        }
        C::current().map_or(ptr::null_mut(), |ctx| box_malloc(ctx, layout.size()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ctx) = C::current() {
            unsafe { box_free(ctx, ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > mem_pool::UNIT {
            return ptr::null_mut();
        }
        C::current().map_or(ptr::null_mut(), |ctx| unsafe {
            box_realloc(ctx, ptr, new_size)
        })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use spin::Once;

    use super::*;

    fn leak_region(bytes: usize) -> *mut u8 {
        unsafe {
            let layout = Layout::from_size_align(bytes, 32).unwrap();
            alloc::alloc::alloc(layout)
        }
    }

    fn test_context(bytes: usize) -> BoxContext {
        unsafe { BoxContext::new(leak_region(bytes), bytes) }
    }

    #[test]
    fn test_malloc_free_roundtrip() {
        let ctx = test_context(1024);
        let ptr = box_malloc(&ctx, 64);
        assert!(!ptr.is_null());
        assert!(ptr.addr().is_multiple_of(mem_pool::UNIT));
        unsafe {
            ptr.write_bytes(0xab, 64);
            box_free(&ctx, ptr);
        }
    }

    #[test]
    fn test_malloc_without_any_heap_returns_null() {
        let ctx: BoxContext = unsafe { BoxContext::new(ptr::null_mut(), 0) };
        assert!(box_malloc(&ctx, 64).is_null());
        assert!(unsafe { box_realloc(&ctx, ptr::null_mut(), 64) }.is_null());
        // No heap and no pointer: nothing to do, nothing to crash on.
        unsafe { box_free(&ctx, ptr::null_mut()) };
    }

    #[test]
    fn test_free_null_is_noop() {
        let ctx = test_context(1024);
        unsafe {
            box_free(&ctx, ptr::null_mut());
            box_free_p(&ctx, ptr::null_mut());
        }
    }

    #[test]
    fn test_realloc_null_acts_as_malloc() {
        let ctx = test_context(1024);
        let ptr = unsafe { box_realloc(&ctx, ptr::null_mut(), 32) };
        assert!(!ptr.is_null());
        unsafe { box_free(&ctx, ptr) };
    }

    #[test]
    fn test_process_variants_target_process_region() {
        let region = leak_region(1024);
        let ctx: BoxContext = unsafe { BoxContext::new(region, 1024) };

        // Install a private heap; the _p entry points still serve from
        // the process region.
        let private_region = leak_region(1024);
        let private =
            unsafe { crate::HeapAllocator::create_with_pool(private_region, 1024) }.unwrap();
        ctx.set_allocator(private);

        let from_active = box_malloc(&ctx, 64);
        let from_process = box_malloc_p(&ctx, 64);
        assert!(!from_active.is_null());
        assert!(!from_process.is_null());

        let process_range = region.addr()..region.addr() + 1024;
        let private_range = private_region.addr()..private_region.addr() + 1024;
        assert!(private_range.contains(&from_active.addr()));
        assert!(process_range.contains(&from_process.addr()));

        unsafe {
            let grown = box_realloc_p(&ctx, from_process, 128);
            assert!(process_range.contains(&grown.addr()));
            box_free_p(&ctx, grown);
            box_free(&ctx, from_active);
        }
    }

    struct TestBox;

    static TEST_CTX: Once<BoxContext> = Once::new();

    impl CurrentBox for TestBox {
        fn current() -> Option<&'static BoxContext> {
            Some(TEST_CTX.call_once(|| unsafe { BoxContext::new(leak_region(4096), 4096) }))
        }
    }

    struct NoBox;

    impl CurrentBox for NoBox {
        fn current() -> Option<&'static BoxContext> {
            None
        }
    }

    #[test]
    fn test_global_alloc_roundtrip() {
        let heap = RuntimeHeap::<TestBox>::new();
        unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            assert!(ptr.addr().is_multiple_of(mem_pool::UNIT));
            ptr.write_bytes(0x42, 64);

            let grown = heap.realloc(ptr, layout, 256);
            assert!(!grown.is_null());
            for i in 0..64 {
                assert_eq!(grown.add(i).read(), 0x42);
            }
            heap.dealloc(grown, Layout::from_size_align(256, 8).unwrap());
        }
    }

    #[test]
    fn test_global_alloc_refuses_strict_alignment() {
        let heap = RuntimeHeap::<TestBox>::new();
        unsafe {
            let layout = Layout::from_size_align(64, 32).unwrap();
            assert!(heap.alloc(layout).is_null());
            assert!(heap.realloc(ptr::null_mut(), layout, 128).is_null());
        }
    }

    #[test]
    fn test_global_alloc_without_current_box() {
        let heap = RuntimeHeap::<NoBox>::new();
        unsafe {
            let layout = Layout::from_size_align(16, 8).unwrap();
            assert!(heap.alloc(layout).is_null());
            heap.dealloc(ptr::null_mut(), layout);
        }
    }
}
