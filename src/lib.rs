//! A segregated-fit free-list allocator with reference-counted chunks.
//!
//! # Usage
//! To use this crate you can add `seg_malloc` as a dependency in your project's `Cargo.toml`.
//! ```toml
//! [dependencies]
//! seg_malloc = "0.1"
//! ```
//!
//! The allocator can be used directly, one element type at a time:
//! ```
//! use seg_malloc::SegListAllocator;
//!
//! let allocator = SegListAllocator::<u32>::new();
//! let p = allocator.allocate(4).unwrap();
//! unsafe {
//!     p.as_ptr().write(7);
//!     assert_eq!(*p.as_ptr(), 7);
//!     allocator.deallocate(p, 4);
//! }
//! ```
//!
//! or behind any container that is generic over an [`Allocator`]:
//! ```
//! #![feature(allocator_api)]
//! use seg_malloc::SegListAllocator;
//!
//! let allocator = SegListAllocator::<u32>::new();
//! let mut v = Vec::new_in(&allocator);
//! v.extend(0..1000_u32);
//! assert_eq!(v.iter().sum::<u32>(), 499_500);
//! ```
//!
//! # Mode of operation
//! Requests are rounded up to power-of-two size classes:
//! - Every size class has its own [freelist](#freelist). An allocation pops the
//!   oldest block off the freelist of its class.
//! - If that freelist is empty a whole [chunk](#chunks) is requested, sliced into
//!   blocks of the class size and all of those blocks are pushed onto the freelist.
//! - On deallocation the block is **not** pushed back onto its freelist. Instead the chunk
//!   registry counts one more returned block for the chunk owning it and, when all blocks
//!   of that chunk are back, releases the chunk as a whole.
//!
//! Below is a list of the abstractions used by the allocator:
//!
//! ## Blocks
//! A block is a fixed-size, power-of-two sized memory region identified by its address.
//! The smallest block can hold both a freelist link and one value of the element type.
//! Blocks are aligned to their own size.
//!
//! ## Freelist
//! The freelist is a FIFO queue embedded within the free blocks of one size class:
//! while a block waits on the freelist its first word holds a link to the next block.
//! Freelists implement the [`BlockManager`] trait.
//!
//! ## Chunks
//! A chunk is one region obtained from a [`ChunkSource`] (by default the system allocator)
//! of at least [`CHUNK_SIZE_FLOOR`] bytes. Chunks are tracked by a [`ChunkRegistry`], which
//! implements the [`ChunkManager`] trait and finds the chunk owning a block by looking up
//! the chunk with the greatest base address not above the block's address.
//!
//! # Threads
//! The allocator is singlethreaded, it is neither `Send` nor `Sync`. Each instance owns its own
//! pool; use `&SegListAllocator` to share one pool between several containers.
//!
//! [`Allocator`]: core::alloc::Allocator
//! [`BlockManager`]: freelist::BlockManager
//! [`ChunkManager`]: chunks::ChunkManager
//! [`ChunkRegistry`]: chunks::ChunkRegistry
//! [`ChunkSource`]: sources::ChunkSource
//! [`CHUNK_SIZE_FLOOR`]: allocators::seg_list::CHUNK_SIZE_FLOOR
#![feature(allocator_api)]

pub use crate::allocators::SegListAllocator;
pub use crate::error::SegAllocError;

pub mod allocators;
pub mod chunks;
mod error;
pub mod freelist;
pub mod sources;
mod util;
