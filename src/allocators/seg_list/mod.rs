//! A singlethreaded segregated-fit allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Size classes
// A request of `n` elements is served from a block of
// `max(next_power_of_two(n * size_of::<T>()), MIN_BLOCK_SIZE)` bytes, where `MIN_BLOCK_SIZE`
// is large enough both for a free-list link and for one `T`. Requests through the
// `Allocator` trait additionally round up to the layout's alignment.
// Every computation on the deallocation side must land in the same class as the matching
// allocation, which is why callers have to pass back the same `n` (or layout).
//
// ## Retirement instead of reuse
// Deallocation never puts a block back on its free list. Blocks are handed out once, and the
// chunk manager is only told that one more block of a chunk came back. Once every block of a
// chunk is back, the chunk is released as a whole. A chunk's blocks can only all come back after
// all of them were handed out, so a retired chunk never has blocks left on a free list.

use core::alloc::{Allocator, AllocError, Layout};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;
use std::fmt::Debug;

use static_assertions::{assert_not_impl_any, const_assert};
use tracing::{debug, error, instrument, Level};

use crate::chunks::{ChunkManager, ChunkRegistry};
use crate::error::SegAllocError;
use crate::freelist::{BlockManager, FreeList, LINK_SIZE};
use crate::util::{block_size_ceil, class_of, SIZE_CLASSES};

/// Smallest chunk requested from the chunk manager, so that small size classes
/// share one request among many blocks.
pub const CHUNK_SIZE_FLOOR: usize = 4096;

const_assert!(CHUNK_SIZE_FLOOR.is_power_of_two());
const_assert!(<FreeList as BlockManager>::LEAST_SIZE >= LINK_SIZE);
const_assert!(<FreeList as BlockManager>::LEAST_SIZE <= CHUNK_SIZE_FLOOR);

// Clones of an `Allocator` must be able to free each other's memory, which independent
// pools can not do. Fresh pools come from `From<&SegListAllocator<_>>` and `rebind`.
assert_not_impl_any!(SegListAllocator<u8>: Clone);
assert_not_impl_any!(SegListAllocator<u64, FreeList, ChunkRegistry<crate::sources::MmapSource>>: Clone);

/// A singlethreaded segregated-fit allocator for values of type `T`.
///
/// Each size class has its own block manager `B` (a [`FreeList`] by default) which is
/// lazily refilled with a whole chunk from the chunk manager `C`
/// (a [`ChunkRegistry`] over the system allocator by default).
///
/// Every instance owns an independent pool. To get a new, empty pool for the same or for another
/// element type use [`From`] or [`rebind`](SegListAllocator::rebind); to share one pool
/// between several containers hand them `&SegListAllocator`.
pub struct SegListAllocator<T, B: BlockManager = FreeList, C: ChunkManager = ChunkRegistry> {
    seg_list: UnsafeCell<[B; SIZE_CLASSES]>,
    chunk_manager: UnsafeCell<C>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, B: BlockManager, C: ChunkManager> Debug for SegListAllocator<T, B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegListAllocator")
            .field("min_block_size", &Self::MIN_BLOCK_SIZE)
            .field("drained", &self.is_drained())
            .finish()
    }
}

impl<T> SegListAllocator<T> {
    /// Creates an allocator with an empty pool drawing chunks from the system allocator.
    pub fn new() -> Self {
        Self::with_chunk_manager(ChunkRegistry::new())
    }
}

impl<T, B: BlockManager + Default, C: ChunkManager> SegListAllocator<T, B, C> {
    /// Creates an allocator with empty free lists over the provided chunk manager.
    pub fn with_chunk_manager(chunk_manager: C) -> Self {
        SegListAllocator {
            seg_list: UnsafeCell::new(core::array::from_fn(|_| B::default())),
            chunk_manager: UnsafeCell::new(chunk_manager),
            _marker: PhantomData,
        }
    }

    /// Creates an allocator for `U` with its own, empty pool.
    pub fn rebind<U>(&self) -> SegListAllocator<U, B, C>
    where
        C: Default,
    {
        SegListAllocator::default()
    }
}

impl<T, B: BlockManager + Default, C: ChunkManager + Default> Default for SegListAllocator<T, B, C> {
    fn default() -> Self {
        Self::with_chunk_manager(C::default())
    }
}

/// Builds an allocator from another one. The new allocator does not share the other's pool.
impl<T, U, B, C> From<&SegListAllocator<U, B, C>> for SegListAllocator<T, B, C>
where
    B: BlockManager + Default,
    C: ChunkManager + Default,
{
    fn from(_: &SegListAllocator<U, B, C>) -> Self {
        Self::default()
    }
}

impl<T, B: BlockManager, C: ChunkManager> SegListAllocator<T, B, C> {
    /// The smallest block this allocator hands out: big enough for a free-list link
    /// and for a single `T`.
    pub const MIN_BLOCK_SIZE: usize = {
        let elem = size_of::<T>().next_power_of_two();
        if B::LEAST_SIZE > elem {
            B::LEAST_SIZE
        } else {
            elem
        }
    };

    /// Allocates room for `n` values of type `T`.
    ///
    /// Fails with [`SegAllocError::SizeOverflow`] if `n * size_of::<T>()` or its size class
    /// can not be represented, and with [`SegAllocError::OutOfMemory`] if a new chunk
    /// was needed but could not be obtained. In both cases the allocator is left unchanged.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO), err(Debug, level = Level::ERROR))]
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, SegAllocError> {
        let block_size = Self::block_size_for(n)?;
        unsafe { self.allocate_block(block_size) }.map(NonNull::cast)
    }

    /// Same as [`allocate`](SegListAllocator::allocate), the returned region is exactly
    /// as large as requested.
    #[inline]
    pub fn allocate_at_least(&self, n: usize) -> Result<NonNull<T>, SegAllocError> {
        self.allocate(n)
    }

    /// Gives back the region pointed to by `ptr`.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](SegListAllocator::allocate) on this
    /// allocator with the same `n`, and must not have been deallocated already.
    ///
    /// # Panics
    /// Panics if `ptr` and `n` do not match any live allocation.
    #[instrument(level = "info", skip(self))]
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let Ok(block_size) = Self::block_size_for(n) else {
            error!("Element count overflows, it can not come from an allocation.");
            panic!("deallocate() called with an element count that overflows: {n}");
        };
        self.deallocate_block(ptr.cast(), block_size);
    }

    /// Returns the block size a request of `n` values would be served from.
    #[inline]
    pub fn block_size_for(n: usize) -> Result<usize, SegAllocError> {
        let bytes = n
            .checked_mul(size_of::<T>())
            .ok_or(SegAllocError::SizeOverflow)?;
        block_size_ceil(bytes, Self::MIN_BLOCK_SIZE).ok_or(SegAllocError::SizeOverflow)
    }

    /// Returns the block size a request described by `layout` would be served from.
    #[inline]
    fn block_size_for_layout(layout: Layout) -> Result<usize, SegAllocError> {
        block_size_ceil(layout.size(), Self::MIN_BLOCK_SIZE)
            .map(|block_size| block_size.max(layout.align()))
            .ok_or(SegAllocError::SizeOverflow)
    }

    /// Returns whether the chunk manager holds no chunks, i.e. every block ever carved
    /// has been handed out and given back.
    pub fn is_drained(&self) -> bool {
        unsafe { (*self.chunk_manager.get()).empty() }
    }

    /// Pops a block of `block_size` bytes, refilling the size class from a new chunk if needed.
    ///
    /// # Safety
    /// `block_size` must be a power of two and callers must ensure that no allocator field
    /// is currently borrowed.
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    unsafe fn allocate_block(&self, block_size: usize) -> Result<NonNull<u8>, SegAllocError> {
        let class = class_of(block_size);
        let manager = &mut (*self.seg_list.get())[class];

        if manager.empty() {
            let malloc_size = block_size.max(CHUNK_SIZE_FLOOR);
            debug!(malloc_size, "Free list is empty, requesting a new chunk.");
            let blocks = (*self.chunk_manager.get()).malloc(malloc_size, block_size)?;
            for block in blocks {
                manager.push(block);
            }
        }

        Ok(manager.pop())
    }

    /// Logs out a block of `block_size` bytes. The block is not put back on its free list.
    ///
    /// # Safety
    /// See [`ChunkManager::logout_block`]. Additionally callers must ensure that no allocator
    /// field is currently borrowed.
    #[instrument(level = "debug", skip(self))]
    unsafe fn deallocate_block(&self, block: NonNull<u8>, block_size: usize) {
        if (*self.chunk_manager.get()).logout_block(block, block_size) {
            debug!("Last block of its chunk returned, chunk released.");
        }
    }
}

//---------------impl Allocator for SegListAllocator---------------//

unsafe impl<T, B: BlockManager, C: ChunkManager> Allocator for SegListAllocator<T, B, C> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let block_size = Self::block_size_for_layout(layout)?;
        let block = unsafe { self.allocate_block(block_size)? };
        Ok(NonNull::slice_from_raw_parts(block, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let Ok(block_size) = Self::block_size_for_layout(layout) else {
            error!(?layout, "Layout can not come from an allocation.");
            panic!("deallocate() called with a layout that overflows: {layout:?}");
        };
        self.deallocate_block(ptr, block_size)
    }
}

impl<T, B: BlockManager, C: ChunkManager> PartialEq for SegListAllocator<T, B, C> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self, other)
    }
}

impl<T, B: BlockManager, C: ChunkManager> Eq for SegListAllocator<T, B, C> {}

#[cfg(test)]
mod tests;
