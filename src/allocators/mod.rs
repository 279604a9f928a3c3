//! The [`SegListAllocator`] allocator.

pub mod seg_list;

pub use seg_list::SegListAllocator;
