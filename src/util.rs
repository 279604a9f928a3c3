//! Size-class arithmetic.
//!
//! A size class is identified by `log2(block_size)`, so class `i` holds blocks of `1 << i` bytes.

use static_assertions::const_assert_eq;
use tracing::error;

/// Number of size classes, one per power of two representable in a `usize`.
pub const SIZE_CLASSES: usize = usize::BITS as usize;

const_assert_eq!(SIZE_CLASSES, core::mem::size_of::<usize>() * 8);

/// Returns the size class of `block_size`.
///
/// # Panics
/// Panics if `block_size` is not a power of two.
#[inline]
pub fn class_of(block_size: usize) -> usize {
    if !block_size.is_power_of_two() {
        error!(block_size, "Block size is not a power of two.");
        panic!("block size {block_size} is not a power of two");
    }
    block_size.trailing_zeros() as usize
}

/// Returns the block size of size class `class`.
///
/// # Panics
/// Panics if `class` is not below [`SIZE_CLASSES`].
#[inline]
pub fn block_size_of(class: usize) -> usize {
    assert!(class < SIZE_CLASSES, "size class {class} is out of range");
    1 << class
}

/// Rounds `size` up to the smallest power of two that is at least `min_block_size`.
/// Returns `None` if that power of two can not be contained in a `usize`.
///
/// `min_block_size` is expected to be a power of two.
#[inline]
pub fn block_size_ceil(size: usize, min_block_size: usize) -> Option<usize> {
    debug_assert!(min_block_size.is_power_of_two());
    size.checked_next_power_of_two()
        .map(|block_size| block_size.max(min_block_size))
}
