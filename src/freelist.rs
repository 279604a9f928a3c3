//! Defines the [`BlockManager`] trait and the [`FreeList`] struct that implements it.
//!
//! A free list threads a singly-linked queue through the blocks it holds:
//! while a block is enqueued its first word is reinterpreted as a [`Link`]
//! to the next block. That aliasing is only valid while the block is free,
//! once a block is popped and handed to a caller its whole extent is payload again.

use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};

use tracing::error;

pub const LINK_SIZE: usize = size_of::<Link>();
pub const LINK_ALIGN: usize = align_of::<Link>();

/// Something that queues free blocks of a single, fixed size.
///
/// # Safety
/// Implementors must hand out from [`pop`](BlockManager::pop) exactly the blocks that
/// were previously given to [`push`](BlockManager::push), each of them once.
pub unsafe trait BlockManager {
    /// The smallest block size (a power of two) this manager is able to queue.
    const LEAST_SIZE: usize;

    /// Returns whether there are no queued blocks.
    fn empty(&self) -> bool;

    /// Queues the block pointed to by `block`.
    ///
    /// # Safety
    /// `block` must point to a writable region of at least [`LEAST_SIZE`](BlockManager::LEAST_SIZE)
    /// bytes aligned for a pointer, which is not in use and stays valid until it is popped.
    unsafe fn push(&mut self, block: NonNull<u8>);

    /// Dequeues a block.
    ///
    /// # Panics
    /// Panics if the manager is empty. Callers are expected to check [`empty`](BlockManager::empty) first.
    fn pop(&mut self) -> NonNull<u8>;

    #[inline(always)]
    fn least_size() -> usize {
        Self::LEAST_SIZE
    }
}

#[repr(C)]
pub struct Link {
    pub next: *mut Link,
}

/// A FIFO queue of free blocks.
#[derive(Debug)]
pub struct FreeList {
    head: *mut Link,
    tail: *mut Link,
}

impl FreeList {
    /// Creates an empty FreeList.
    #[inline]
    pub const fn new() -> Self {
        FreeList {
            head: null_mut(),
            tail: null_mut(),
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList::new()
    }
}

unsafe impl BlockManager for FreeList {
    const LEAST_SIZE: usize = LINK_SIZE.next_power_of_two();

    #[inline]
    fn empty(&self) -> bool {
        self.head.is_null()
    }

    /// Writes a link into `block` and appends it to the back of the queue.
    /// This operation has a time complexity of *O*(1).
    unsafe fn push(&mut self, block: NonNull<u8>) {
        let link: *mut Link = block.as_ptr().cast();
        debug_assert_eq!(link as usize % LINK_ALIGN, 0);

        link.write(Link { next: null_mut() });
        match self.tail.is_null() {
            true => self.head = link,
            false => (*self.tail).next = link,
        }
        self.tail = link;
    }

    /// Removes the oldest block from the front of the queue.
    /// This operation has a time complexity of *O*(1).
    fn pop(&mut self) -> NonNull<u8> {
        let Some(head) = NonNull::new(self.head) else {
            error!("Popped an empty free list.");
            panic!("pop() called on an empty free list");
        };
        unsafe {
            self.head = (*head.as_ptr()).next;
        }
        if self.head.is_null() {
            self.tail = null_mut();
        }
        head.cast()
    }
}
