//! [`ChunkSource`] trait and structures that implement it.
//!
//! The [`ChunkSource`] trait allows users to change where the
//! [`ChunkRegistry`](crate::chunks::ChunkRegistry) obtains its chunks from.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};
use std::alloc::System;

use libc::{mmap, munmap, sysconf, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE};
use tracing::debug;

/// A trait for types that hand out and take back whole chunks of memory.
///
/// # Safety
/// * a successful [`acquire`](ChunkSource::acquire) must return a region of at least
///   `layout.size()` bytes aligned to `layout.align()` that no one else is using.
/// * moving the source must not invalidate any region it has handed out.
pub unsafe trait ChunkSource {
    /// Obtains a region described by `layout`.
    /// Returns `Err(())` if the region could not be obtained.
    ///
    /// # Safety
    /// `layout.size()` must be nonzero.
    unsafe fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>, ()>;

    /// Gives back a region previously obtained from [`acquire`](ChunkSource::acquire).
    ///
    /// # Safety
    /// `ptr` must have been returned by `acquire` on this source with the same `layout`
    /// and must not be used afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// A source that forwards to the [`System`] allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSource;

unsafe impl ChunkSource for SystemSource {
    #[inline]
    unsafe fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>, ()> {
        NonNull::new(System.alloc(layout)).ok_or(())
    }

    #[inline]
    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        System.dealloc(ptr.as_ptr(), layout)
    }
}

/// A source that maps anonymous pages with [`libc::mmap`] and unmaps them on release.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSource;

impl MmapSource {
    #[inline(always)]
    pub const fn new() -> Self {
        MmapSource
    }

    fn page_size() -> usize {
        let page_size = unsafe { sysconf(_SC_PAGESIZE) };
        debug_assert!(page_size > 0, "sysconf(_SC_PAGESIZE) should never fail.");
        page_size as usize
    }

    unsafe fn map(len: usize) -> Result<*mut u8, ()> {
        let p = mmap(null_mut(), len, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0);
        match p == MAP_FAILED {
            true => Err(()),
            false => Ok(p.cast()),
        }
    }
}

unsafe impl ChunkSource for MmapSource {
    unsafe fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>, ()> {
        let page_size = Self::page_size();
        if layout.align() <= page_size {
            return NonNull::new(Self::map(layout.size())?).ok_or(());
        }

        // Over-map by the alignment and trim both ends so that the kept part is aligned.
        let len = layout.size().checked_add(layout.align()).ok_or(())?;
        let raw = Self::map(len)?;
        let offset = raw.align_offset(layout.align());
        debug_assert_eq!(offset % page_size, 0);
        let start = raw.add(offset);
        let tail = len - offset - layout.size();
        if offset > 0 {
            let ret = munmap(raw.cast(), offset);
            debug_assert_eq!(ret, 0, "munmap() of the leading trim should never fail.");
        }
        if tail > 0 {
            let ret = munmap(start.add(layout.size()).cast(), tail);
            debug_assert_eq!(ret, 0, "munmap() of the trailing trim should never fail.");
        }
        debug!(?raw, ?start, offset, tail, "Trimmed over-aligned mapping.");
        NonNull::new(start).ok_or(())
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let ret = munmap(ptr.as_ptr().cast(), layout.size());
        debug_assert_eq!(ret, 0, "munmap() of a mapped chunk should never fail.");
    }
}

unsafe impl<S: ChunkSource + ?Sized> ChunkSource for &mut S {
    unsafe fn acquire(&mut self, layout: Layout) -> Result<NonNull<u8>, ()> {
        (**self).acquire(layout)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        (**self).release(ptr, layout)
    }
}
