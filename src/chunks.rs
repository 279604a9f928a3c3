//! Defines the [`ChunkManager`] trait and the reference-counting [`ChunkRegistry`].
//!
//! A chunk is one region obtained from a [`ChunkSource`] and sliced into equal,
//! power-of-two sized blocks. The registry remembers every live chunk, keyed by its
//! base address and grouped by size class, and counts how many of its blocks have
//! been logged out. When that count reaches the number of blocks the chunk is
//! retired, i.e. dropped from the registry and released to its source.
//!
//! Ownership of a block is resolved with a predecessor search: the owning chunk is
//! the one with the greatest base address not exceeding the block's address.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::BTreeMap;

use tracing::{debug, error, instrument, Level};

use crate::error::SegAllocError;
use crate::sources::{ChunkSource, SystemSource};
use crate::util::{block_size_of, class_of};

/// Something that hands out blocks in bulk and learns when they are given back.
///
/// # Safety
/// Implementors must return from [`malloc`](ChunkManager::malloc) distinct, writable blocks
/// of exactly `block_size` bytes, each aligned to `block_size`, which stay valid
/// at least until they are logged out.
pub unsafe trait ChunkManager {
    /// Obtains a chunk of `malloc_size` bytes and slices it into `block_size` blocks,
    /// returned in ascending address order.
    ///
    /// On failure nothing is registered and [`SegAllocError::OutOfMemory`] is returned.
    ///
    /// # Panics
    /// Panics if either size is not a power of two or if `malloc_size < block_size`.
    fn malloc(
        &mut self,
        malloc_size: usize,
        block_size: usize,
    ) -> Result<Vec<NonNull<u8>>, SegAllocError>;

    /// Records that `block` has been given back. Returns `true` if this retired the
    /// chunk owning `block`, in which case every block of that chunk is now invalid.
    ///
    /// # Safety
    /// `block` must have been returned by [`malloc`](ChunkManager::malloc) with the same
    /// `block_size` and must not have been logged out before.
    ///
    /// # Panics
    /// Panics if no live chunk owns `block`.
    unsafe fn logout_block(&mut self, block: NonNull<u8>, block_size: usize) -> bool;

    /// Returns whether no chunk is live. Meant for leak checks, not for hot paths.
    fn empty(&self) -> bool;
}

/// A chunk: a region made of `block_count` blocks of `block_size` bytes.
#[derive(Debug)]
pub struct Chunk {
    base: NonNull<u8>,
    block_size: usize,
    block_count: usize,
    used_count: usize,
}

impl Chunk {
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Number of blocks that have been logged out so far.
    #[inline]
    pub fn used_count(&self) -> usize {
        self.used_count
    }

    /// Total size of the chunk in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.block_size * self.block_count
    }

    /// Returns whether `ptr` lies within the chunk.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        base <= addr && addr - base < self.size()
    }

    #[inline]
    fn layout(&self) -> Layout {
        // The same layout was validated when the chunk was created.
        unsafe { Layout::from_size_align_unchecked(self.size(), self.block_size) }
    }
}

/// A [`ChunkManager`] that reference-counts logged out blocks and retires
/// chunks once all of their blocks are back.
///
/// Chunks still live when the registry is dropped are released unconditionally.
#[derive(Debug)]
pub struct ChunkRegistry<S: ChunkSource = SystemSource> {
    /// Indexed by size class, each map is keyed by chunk base address.
    chunks: Vec<BTreeMap<usize, Chunk>>,
    source: S,
}

impl ChunkRegistry<SystemSource> {
    /// Creates an empty registry drawing chunks from the system allocator.
    #[inline]
    pub const fn new() -> Self {
        Self::with_source(SystemSource)
    }
}

impl<S: ChunkSource> ChunkRegistry<S> {
    /// Creates an empty registry drawing chunks from `source`.
    #[inline]
    pub const fn with_source(source: S) -> Self {
        ChunkRegistry {
            chunks: Vec::new(),
            source,
        }
    }

    /// Returns the number of live chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().map(BTreeMap::len).sum()
    }

    /// Returns the live chunk of size class `block_size` which owns `ptr`, if any.
    pub fn find_chunk(&self, ptr: NonNull<u8>, block_size: usize) -> Option<&Chunk> {
        let addr = ptr.as_ptr() as usize;
        self.chunks
            .get(class_of(block_size))?
            .range(..=addr)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains(ptr))
    }
}

impl Default for ChunkRegistry<SystemSource> {
    fn default() -> Self {
        ChunkRegistry::new()
    }
}

unsafe impl<S: ChunkSource> ChunkManager for ChunkRegistry<S> {
    #[instrument(level = "debug", skip(self), err(Debug, level = Level::ERROR))]
    fn malloc(
        &mut self,
        malloc_size: usize,
        block_size: usize,
    ) -> Result<Vec<NonNull<u8>>, SegAllocError> {
        assert!(
            malloc_size.is_power_of_two(),
            "chunk size {malloc_size} is not a power of two"
        );
        assert!(
            malloc_size >= block_size,
            "chunk size {malloc_size} is smaller than block size {block_size}"
        );
        let class = class_of(block_size);
        debug_assert_eq!(block_size_of(class), block_size);

        let Ok(layout) = Layout::from_size_align(malloc_size, block_size) else {
            error!("Chunk layout is not representable.");
            return Err(SegAllocError::OutOfMemory);
        };
        let Ok(base) = (unsafe { self.source.acquire(layout) }) else {
            error!("Chunk source is out of memory.");
            return Err(SegAllocError::OutOfMemory);
        };
        debug_assert_eq!(base.as_ptr() as usize % block_size, 0);

        // Both sizes are powers of two, so the chunk divides into blocks exactly.
        let block_count = malloc_size / block_size;
        let blocks: Vec<NonNull<u8>> = (0..block_count)
            .map(|i| unsafe { base.add(i * block_size) })
            .collect();

        if self.chunks.len() <= class {
            self.chunks.resize_with(class + 1, BTreeMap::new);
        }
        let old = self.chunks[class].insert(
            base.as_ptr() as usize,
            Chunk {
                base,
                block_size,
                block_count,
                used_count: 0,
            },
        );
        debug_assert!(old.is_none(), "A live chunk can not be handed out twice.");
        debug!(?base, block_count, "Registered a new chunk.");

        Ok(blocks)
    }

    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    unsafe fn logout_block(&mut self, block: NonNull<u8>, block_size: usize) -> bool {
        let class = class_of(block_size);
        let addr = block.as_ptr() as usize;

        let owner = self
            .chunks
            .get_mut(class)
            .and_then(|set| set.range_mut(..=addr).next_back());
        let Some((&base, chunk)) = owner else {
            error!("No live chunk owns the block.");
            panic!("logout_block() could not find a chunk for {block:?} of size {block_size}");
        };
        if !chunk.contains(block) {
            error!(?chunk, "Block lies past the end of its predecessor chunk.");
            panic!("logout_block() could not find a chunk for {block:?} of size {block_size}");
        }
        debug_assert_eq!((addr - base) % block_size, 0, "Blocks start at block boundaries.");

        chunk.used_count += 1;
        assert!(
            chunk.used_count <= chunk.block_count,
            "chunk at {base:#x} had more blocks logged out than it holds"
        );
        if chunk.used_count < chunk.block_count {
            return false;
        }

        let chunk = self.chunks[class]
            .remove(&base)
            .expect("The owning chunk was just found.");
        self.source.release(chunk.base, chunk.layout());
        debug!(?chunk.base, chunk.block_count, "Retired chunk.");
        true
    }

    fn empty(&self) -> bool {
        self.chunks.iter().all(BTreeMap::is_empty)
    }
}

impl<S: ChunkSource> Drop for ChunkRegistry<S> {
    fn drop(&mut self) {
        let mut released = 0_usize;
        for set in &mut self.chunks {
            for (_, chunk) in std::mem::take(set) {
                unsafe { self.source.release(chunk.base, chunk.layout()) };
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "Released live chunks on teardown.");
        }
    }
}
