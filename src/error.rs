//! The recoverable errors of the allocator.

use core::alloc::AllocError;
use std::fmt;

/// Errors an allocation request can fail with.
///
/// Neither of them leaves the allocator in a changed state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SegAllocError {
    /// The requested byte count (or its size class) does not fit in a `usize`.
    SizeOverflow,
    /// The underlying source could not provide a new chunk.
    OutOfMemory,
}

impl fmt::Display for SegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegAllocError::SizeOverflow => f.write_str("requested allocation size overflows usize"),
            SegAllocError::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

impl std::error::Error for SegAllocError {}

impl From<SegAllocError> for AllocError {
    #[inline]
    fn from(_: SegAllocError) -> Self {
        AllocError
    }
}
