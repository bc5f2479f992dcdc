//! Per-box heap allocation core for an isolated-execution monitor.
//!
//! Each isolated execution domain ("box") owns a private heap. This crate
//! multiplexes the runtime's allocation entry points onto the heap of the
//! box that is currently executing, so that one box's allocator failures or
//! corruption never leak into another box's memory.
//!
//! The pieces, leaf first:
//!
//! - [`pool::BlockPool`]: seam to the fixed-pool block allocator that
//!   manages a single contiguous region ([`mem_pool::MemPool`] by default)
//! - [`page_source::PageSource`]: grants and revokes fixed-size physical
//!   pages; [`page_source::FixedPagePool`] is the built-in implementation
//! - [`allocator::HeapAllocator`]: one logical heap spanning either a
//!   caller-owned region or several independently granted pages, searched
//!   first-fit in page order
//! - [`selector::BoxContext`]: per-box state deciding which allocator
//!   backs "the heap" right now, with exactly-once lazy initialization of
//!   the box's process heap
//! - [`hooks`]: the thin adapter the runtime's `malloc`/`realloc`/`free`
//!   are redirected to, including a [`core::alloc::GlobalAlloc`] wrapper
//!
//! # Example
//!
//! ```rust,ignore
//! use boxheap::{BoxContext, box_free, box_malloc};
//!
//! // The monitor reserves a process heap region per box at creation time.
//! let ctx = unsafe { BoxContext::new(process_heap_base, process_heap_size) };
//!
//! // First allocation lazily turns the process heap into a pool-backed
//! // allocator; later calls reuse it.
//! let ptr = box_malloc(&ctx, 64);
//! box_free(&ctx, ptr);
//! ```

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod hooks;
pub mod page_source;
pub mod pool;
pub mod selector;

pub use crate::{
    allocator::{CreateError, DestroyError, HeapAllocator},
    hooks::{
        CurrentBox, RuntimeHeap, box_free, box_free_p, box_malloc, box_malloc_p, box_realloc,
        box_realloc_p,
    },
    page_source::{FixedPagePool, PageGrantError, PageReleaseError, PageSource},
    pool::{BlockPool, MemPoolBackend},
    selector::{ActiveHeapError, BoxContext, HeapRef},
};
