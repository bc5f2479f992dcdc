//! Fixed-pool block allocator over a single contiguous memory region.
//!
//! A pool is created *inside* the caller-provided region: the pool head
//! lives at the start of the region and every block carries a header
//! immediately before the data pointer handed to the caller. The header
//! records the block's usable length, so the length can be recovered from
//! the data pointer alone. Higher layers rely on this to implement
//! `realloc` without any help from this allocator.
//!
//! # Algorithm
//!
//! - **Free list**: free blocks are kept in a singly-linked list sorted by
//!   memory address
//! - **Allocation**: first-fit scan of the free list; oversized blocks are
//!   split and the tail is returned to the list
//! - **Deallocation**: freed blocks are inserted back in address order and
//!   merged with adjacent free neighbors immediately
//!
//! # Memory Layout
//!
//! ```text
//! Region:
//! ┌────────────────────┬────────────────────────────────────────────┐
//! │ MemPool head (32B) │ blocks ...                                 │
//! └────────────────────┴────────────────────────────────────────────┘
//!
//! Block (free or allocated):
//! ┌──────────────────────────────────┬───────────────────────┐
//! │ BlockHeader (16 bytes)           │ data (`len` bytes)    │
//! │ ┌─────────────┬─────────────────┐│                       │
//! │ │ len: usize  │ next: *mut Hdr  ││                       │
//! │ └─────────────┴─────────────────┘│                       │
//! └──────────────────────────────────┴───────────────────────┘
//! ```
//!
//! An allocated block's `next` field is repurposed as an ownership tag
//! (it points back at the pool head). [`MemPool::free`] uses the tag to
//! reject pointers that were not produced by this pool, reporting them as
//! "not found" instead of corrupting the free list.
//!
//! # Thread Safety
//!
//! All operations take the pool by raw handle and require external
//! synchronization for concurrent access.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::ptr::{self, NonNull};

/// Allocation granularity in bytes. Sizes are rounded up to a multiple of
/// this, and data pointers are aligned to it.
pub const UNIT: usize = 16;

/// Marker stored in the pool head, checked on every operation.
const POOL_MAGIC: usize = 0x6d70_6f6f_6c31;

/// Per-block bookkeeping header.
///
/// Lives immediately before the data area of every block. For a free block
/// `next` links the address-ordered free list; for an allocated block it
/// holds the pool's ownership tag.
#[repr(C, align(16))]
struct BlockHeader {
    /// Usable length of the data area in bytes.
    len: usize,
    /// Next free block, or the ownership tag while allocated.
    next: *mut Self,
}
const _: () = assert!(size_of::<BlockHeader>() == UNIT);

/// Pool head, stored at the start of the managed region.
#[repr(C, align(32))]
pub struct MemPool {
    magic: usize,
    /// Total managed bytes, pool head included.
    limit: usize,
    /// Bytes currently allocated, headers included.
    used: usize,
    free: *mut BlockHeader,
}
const _: () = assert!(size_of::<MemPool>() == 32);

impl MemPool {
    /// Size of the implicit per-block header in bytes.
    pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

    /// Bookkeeping overhead charged per allocation when planning capacity:
    /// two headers' worth, covering the block's own header plus the
    /// fragmentation loss of a split.
    pub const BLOCK_OVERHEAD: usize = 2 * Self::HEADER_SIZE;

    /// Smallest region that [`init`](Self::init) accepts: pool head plus
    /// one minimal block.
    pub const MIN_REGION_SIZE: usize = size_of::<Self>() + Self::HEADER_SIZE + UNIT;

    /// Creates a pool inside the given memory region.
    ///
    /// The region is aligned and trimmed to the pool's granularity; the
    /// remainder becomes a single free block. Returns `None` if the region
    /// is too small to hold the pool head and one minimal block.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `region..region + bytes` is valid, writable memory
    /// - the region is not in use by any other allocator or code
    /// - the region stays valid and untouched (except through this pool)
    ///   for as long as the pool is used
    pub unsafe fn init(region: *mut u8, bytes: usize) -> Option<NonNull<Self>> {
        let offset = region.align_offset(align_of::<Self>());
        let usable = bytes.saturating_sub(offset) / UNIT * UNIT;
        if usable < Self::MIN_REGION_SIZE {
            return None;
        }

        unsafe {
            let head = region.add(offset).cast::<Self>();
            let first = head
                .cast::<u8>()
                .add(size_of::<Self>())
                .cast::<BlockHeader>();
            (*first).len = usable - size_of::<Self>() - Self::HEADER_SIZE;
            (*first).next = ptr::null_mut();
            head.write(Self {
                magic: POOL_MAGIC,
                limit: usable,
                used: 0,
                free: first,
            });
            Some(NonNull::new_unchecked(head))
        }
    }

    /// Allocates `size` bytes from the pool.
    ///
    /// Uses first-fit over the address-ordered free list. A zero `size` is
    /// served as a minimal block so the returned pointer is always valid
    /// and distinct. Returns `None` when no free block is large enough.
    ///
    /// # Safety
    ///
    /// `pool` must come from [`init`](Self::init) over a still-valid region,
    /// and the caller must serialize access to the pool.
    pub unsafe fn alloc(pool: NonNull<Self>, size: usize) -> Option<NonNull<u8>> {
        unsafe {
            let head = pool.as_ptr();
            assert_eq!((*head).magic, POOL_MAGIC, "not a MemPool region");

            let rsize = size.max(1).checked_next_multiple_of(UNIT)?;

            let mut prev: *mut BlockHeader = ptr::null_mut();
            let mut current = (*head).free;
            while !current.is_null() {
                if (*current).len >= rsize {
                    let replacement = if (*current).len - rsize >= Self::HEADER_SIZE + UNIT {
                        // Split: the tail becomes a new free block.
                        let tail = current
                            .cast::<u8>()
                            .add(Self::HEADER_SIZE + rsize)
                            .cast::<BlockHeader>();
                        (*tail).len = (*current).len - rsize - Self::HEADER_SIZE;
                        (*tail).next = (*current).next;
                        (*current).len = rsize;
                        tail
                    } else {
                        (*current).next
                    };
                    if prev.is_null() {
                        (*head).free = replacement;
                    } else {
                        (*prev).next = replacement;
                    }
                    (*current).next = Self::used_mark(pool);
                    (*head).used += (*current).len + Self::HEADER_SIZE;
                    let data = current.cast::<u8>().add(Self::HEADER_SIZE);
                    return Some(NonNull::new_unchecked(data));
                }
                prev = current;
                current = (*current).next;
            }
            None
        }
    }

    /// Returns a block to the pool.
    ///
    /// Returns `false` ("not found") when `ptr` is not a live allocation of
    /// this pool: null, misaligned, outside the region, already freed, or
    /// produced by a different pool. The pool state is untouched in that
    /// case. On success the block rejoins the free list with coalescing.
    ///
    /// # Safety
    ///
    /// `pool` must come from [`init`](Self::init) over a still-valid region,
    /// and the caller must serialize access to the pool.
    pub unsafe fn free(pool: NonNull<Self>, ptr: *mut u8) -> bool {
        unsafe {
            let head = pool.as_ptr();
            assert_eq!((*head).magic, POOL_MAGIC, "not a MemPool region");

            if ptr.is_null() || !ptr.addr().is_multiple_of(UNIT) {
                return false;
            }
            let start = head.cast::<u8>();
            let first_data = start.add(size_of::<Self>() + Self::HEADER_SIZE);
            let end = start.add((*head).limit);
            if ptr < first_data || ptr >= end {
                return false;
            }

            let block = ptr.sub(Self::HEADER_SIZE).cast::<BlockHeader>();
            if (*block).next != Self::used_mark(pool) {
                // Already free, or never a block of this pool.
                return false;
            }

            (*head).used -= (*block).len + Self::HEADER_SIZE;
            (*block).next = ptr::null_mut();
            Self::insert_free(head, block);
            true
        }
    }

    /// Recovers the usable length of a live allocation from its implicit
    /// header.
    ///
    /// # Safety
    ///
    /// `ptr` must be a data pointer previously returned by
    /// [`alloc`](Self::alloc) and not yet freed.
    #[must_use]
    pub unsafe fn block_len(ptr: NonNull<u8>) -> usize {
        unsafe {
            let block = ptr.as_ptr().sub(Self::HEADER_SIZE).cast::<BlockHeader>();
            (*block).len
        }
    }

    /// Bytes currently allocated, headers included.
    ///
    /// # Safety
    ///
    /// `pool` must come from [`init`](Self::init) over a still-valid region.
    #[must_use]
    pub unsafe fn used_bytes(pool: NonNull<Self>) -> usize {
        unsafe { (*pool.as_ptr()).used }
    }

    /// Ownership tag written into allocated blocks' `next` field.
    fn used_mark(pool: NonNull<Self>) -> *mut BlockHeader {
        pool.as_ptr().cast()
    }

    /// Inserts a free block in address order, merging with adjacent free
    /// neighbors.
    ///
    /// # Safety
    ///
    /// `block` must be a valid, unlinked block of this pool that is not in
    /// the free list.
    unsafe fn insert_free(head: *mut Self, block: *mut BlockHeader) {
        unsafe {
            assert!(!block.is_null());
            assert!((*block).next.is_null());

            if (*head).free.is_null() {
                (*head).free = block;
                return;
            }

            if block < (*head).free {
                (*head).free = Self::concat(block, (*head).free);
                return;
            }

            let mut current = (*head).free;
            loop {
                assert!(current < block, "block already in free list");
                if block < (*current).next || (*current).next.is_null() {
                    break;
                }
                current = (*current).next;
            }

            let block = Self::concat(block, (*current).next);
            Self::concat(current, block);
        }
    }

    /// Links `prev` before `next`, merging them when they are adjacent in
    /// memory. Either side may be null.
    ///
    /// # Safety
    ///
    /// Non-null arguments must point to valid free blocks with
    /// `prev < next`.
    unsafe fn concat(prev: *mut BlockHeader, next: *mut BlockHeader) -> *mut BlockHeader {
        if prev.is_null() {
            return next;
        }
        if next.is_null() {
            return prev;
        }

        unsafe {
            let prev_end = prev.cast::<u8>().add(Self::HEADER_SIZE + (*prev).len);
            if ptr::eq(prev_end, next.cast()) {
                (*prev).len += Self::HEADER_SIZE + (*next).len;
                (*prev).next = (*next).next;
            } else {
                (*prev).next = next;
            }
        }

        prev
    }
}
