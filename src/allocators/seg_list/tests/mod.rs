use std::rc::Rc;

use crate::sources::limited_source::{LimitedSource, Stats};
use crate::sources::MmapSource;

use super::*;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

type Limited<T> = SegListAllocator<T, FreeList, ChunkRegistry<LimitedSource>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn limited<T>(budget: usize) -> (Limited<T>, Rc<Stats>) {
    let source = LimitedSource::new(budget);
    let stats = source.stats();
    (
        SegListAllocator::with_chunk_manager(ChunkRegistry::with_source(source)),
        stats,
    )
}

/// Number of blocks a chunk of size class `block_size` is sliced into.
fn blocks_per_chunk(block_size: usize) -> usize {
    block_size.max(CHUNK_SIZE_FLOOR) / block_size
}

#[test]
fn test_1() {
    init_tracing();
    let allocator = SegListAllocator::<i32>::new();
    let p = allocator.allocate(1).unwrap();
    unsafe {
        p.as_ptr().write(1);
        assert_eq!(*p.as_ptr(), 1);
        allocator.deallocate(p, 1);
    }
}

#[test]
fn test_2() {
    let allocator = SegListAllocator::<i32>::new();
    let mut scale = 2;
    while scale < 100_000 {
        let p = allocator.allocate(scale).unwrap().as_ptr();
        unsafe {
            for i in 0..scale {
                p.add(i).write(i as i32);
            }
            for i in (0..scale).rev() {
                assert_eq!(*p.add(i), i as i32);
            }
            allocator.deallocate(NonNull::new_unchecked(p), scale);
        }
        scale *= 2;
    }
}

#[test]
fn test_min_block_size_1() {
    assert_eq!(SegListAllocator::<u8>::MIN_BLOCK_SIZE, FreeList::least_size());
    assert_eq!(SegListAllocator::<()>::MIN_BLOCK_SIZE, FreeList::least_size());
    assert_eq!(SegListAllocator::<[u8; 3]>::MIN_BLOCK_SIZE, FreeList::least_size());
    assert_eq!(SegListAllocator::<[u64; 5]>::MIN_BLOCK_SIZE, 64);
    assert_eq!(SegListAllocator::<[u8; 4097]>::MIN_BLOCK_SIZE, 8192);
}

#[test]
fn test_block_size_for_1() {
    let least = FreeList::least_size();
    assert_eq!(SegListAllocator::<u8>::block_size_for(0), Ok(least));
    assert_eq!(SegListAllocator::<u8>::block_size_for(1), Ok(least));
    assert_eq!(SegListAllocator::<u8>::block_size_for(9), Ok(16.max(least)));
    assert_eq!(SegListAllocator::<u8>::block_size_for(100), Ok(128));
    assert_eq!(SegListAllocator::<[u8; 3]>::block_size_for(3), Ok(16));
    assert_eq!(SegListAllocator::<[u64; 5]>::block_size_for(1), Ok(64));
    assert_eq!(SegListAllocator::<[u64; 5]>::block_size_for(2), Ok(128));
    assert_eq!(SegListAllocator::<()>::block_size_for(usize::MAX), Ok(least));
}

#[test]
fn test_block_size_for_2() {
    // The chosen block is the smallest power of two covering both the request and the minimum.
    fn check<T>() {
        let min = SegListAllocator::<T>::MIN_BLOCK_SIZE;
        for n in 0..2000 {
            let bytes = n * size_of::<T>();
            let block_size = SegListAllocator::<T>::block_size_for(n).unwrap();
            assert!(block_size.is_power_of_two());
            assert!(block_size >= bytes && block_size >= min);
            assert!(block_size == min || block_size / 2 < bytes);
        }
    }
    check::<u8>();
    check::<u16>();
    check::<[u8; 3]>();
    check::<u64>();
    check::<[u32; 7]>();
    check::<[u64; 33]>();
}

#[test]
fn test_size_overflow_1() {
    let (allocator, stats) = limited::<u64>(usize::MAX);
    assert_eq!(
        allocator.allocate(usize::MAX / 4).unwrap_err(),
        SegAllocError::SizeOverflow
    );
    assert_eq!(
        allocator.allocate_at_least(usize::MAX).unwrap_err(),
        SegAllocError::SizeOverflow
    );
    assert_eq!(stats.acquired.get(), 0);
    assert_eq!(stats.failed.get(), 0);
    assert!(allocator.is_drained());
}

#[test]
fn test_size_overflow_2() {
    // The byte count fits, but no power of two covers it.
    let (allocator, stats) = limited::<u8>(usize::MAX);
    let n = (1_usize << (usize::BITS - 1)) + 1;
    assert_eq!(allocator.allocate(n).unwrap_err(), SegAllocError::SizeOverflow);
    assert_eq!(stats.acquired.get(), 0);
}

#[test]
fn test_out_of_memory_1() {
    init_tracing();
    let (allocator, stats) = limited::<u64>(CHUNK_SIZE_FLOOR);
    let per_chunk = blocks_per_chunk(8);

    let ptrs: Vec<NonNull<u64>> = (0..per_chunk).map(|_| allocator.allocate(1).unwrap()).collect();
    assert_eq!(stats.acquired.get(), 1);

    assert_eq!(allocator.allocate(1).unwrap_err(), SegAllocError::OutOfMemory);
    assert_eq!(stats.failed.get(), 1);
    assert!(!allocator.is_drained());

    for p in ptrs {
        unsafe { allocator.deallocate(p, 1) };
    }
    assert!(allocator.is_drained());
    assert_eq!(stats.live_bytes.get(), 0);

    // Nothing was left behind by the failed attempt, the class refills normally.
    let p = allocator.allocate(1).unwrap();
    assert_eq!(stats.acquired.get(), 2);
    unsafe { allocator.deallocate(p, 1) };
}

#[test]
fn test_no_reuse_1() {
    let allocator = SegListAllocator::<u32>::new();
    let keep = allocator.allocate(1).unwrap();
    let p1 = allocator.allocate(1).unwrap();
    unsafe { allocator.deallocate(p1, 1) };
    let p2 = allocator.allocate(1).unwrap();
    assert_ne!(p1, p2, "A returned block must not be handed out again.");
    unsafe {
        allocator.deallocate(p2, 1);
        allocator.deallocate(keep, 1);
    }
}

#[test]
fn test_no_reuse_2() {
    // Blocks come out of a chunk in ascending order, one after another.
    let (allocator, stats) = limited::<u64>(usize::MAX);
    let per_chunk = blocks_per_chunk(8);
    let mut prev: Option<NonNull<u64>> = None;

    for i in 0..per_chunk {
        let p = allocator.allocate(1).unwrap();
        if let Some(prev) = prev {
            assert_eq!(p.as_ptr() as usize - prev.as_ptr() as usize, 8);
        }
        prev = Some(p);
        unsafe { allocator.deallocate(p, 1) };
        assert_eq!(stats.released.get(), (i == per_chunk - 1) as usize);
    }
    assert!(allocator.is_drained());

    let _p = allocator.allocate(1).unwrap();
    assert_eq!(stats.acquired.get(), 2);
}

#[test]
fn test_allocate_deallocate_loop_1() {
    let (allocator, stats) = limited::<i32>(usize::MAX);
    let iterations: usize = 100_000;
    for i in 0..iterations {
        let p = allocator.allocate(1).unwrap();
        unsafe {
            p.as_ptr().write(i as i32);
            allocator.deallocate(p, 1);
        }
    }
    let per_chunk = blocks_per_chunk(SegListAllocator::<i32>::MIN_BLOCK_SIZE);
    assert_eq!(stats.acquired.get(), iterations.div_ceil(per_chunk));
    assert_eq!(stats.released.get(), iterations / per_chunk);
    assert!(stats.live_bytes.get() <= CHUNK_SIZE_FLOOR);
}

#[test]
fn test_leak_free_1() {
    let mut rng = StdRng::seed_from_u64(0x5e6_a110c);
    let (allocator, stats) = limited::<u8>(usize::MAX);

    // Draw every block of one chunk per class, so that all of them can come back.
    let mut live: Vec<(NonNull<u8>, usize)> = vec![];
    for class in 3..16 {
        let n = 1_usize << class;
        let count = blocks_per_chunk(SegListAllocator::<u8>::block_size_for(n).unwrap());
        for _ in 0..count {
            live.push((allocator.allocate(n).unwrap(), n));
        }
    }
    live.shuffle(&mut rng);

    for (p, n) in live {
        assert!(!allocator.is_drained());
        unsafe { allocator.deallocate(p, n) };
    }
    assert!(allocator.is_drained());
    assert_eq!(stats.acquired.get(), 13);
    assert_eq!(stats.released.get(), 13);
    assert_eq!(stats.live_bytes.get(), 0);
}

#[test]
fn test_alignment_1() {
    let allocator = SegListAllocator::<u8>::new();
    let mut live = vec![];
    for class in 0..20 {
        let n = (1_usize << class) + 1;
        let block_size = SegListAllocator::<u8>::block_size_for(n).unwrap();
        let p = allocator.allocate(n).unwrap();
        assert_eq!(p.as_ptr() as usize % block_size, 0);
        unsafe { p.as_ptr().write_bytes(0x5A, n) };
        live.push((p, n));
    }
    for (p, n) in live {
        unsafe { allocator.deallocate(p, n) };
    }
}

#[test]
fn test_large_block_1() {
    // A block above the chunk floor gets a chunk of its own, retired on deallocation.
    let (allocator, stats) = limited::<u8>(usize::MAX);
    let p = allocator.allocate(10_000).unwrap();
    assert_eq!(stats.live_bytes.get(), 16384);
    unsafe { allocator.deallocate(p, 10_000) };
    assert_eq!(stats.released.get(), 1);
    assert!(allocator.is_drained());
}

#[test]
fn test_independent_pools_1() {
    let a = SegListAllocator::<u32>::new();
    let b = a.rebind::<u64>();
    let c = SegListAllocator::<u32>::from(&a);
    let d = SegListAllocator::<u16>::from(&b);

    let p = a.allocate(4).unwrap();
    assert!(!a.is_drained());
    assert!(b.is_drained());
    assert!(c.is_drained());
    assert!(d.is_drained());
    assert_ne!(a, c);
    assert_eq!(a, a);

    let q = c.allocate(4).unwrap();
    assert_ne!(p, q);
    unsafe {
        a.deallocate(p, 4);
        c.deallocate(q, 4);
    }
}

#[test]
fn test_teardown_1() {
    let (allocator, stats) = limited::<u64>(usize::MAX);
    for n in [1, 3, 100, 1000] {
        allocator.allocate(n).unwrap();
    }
    assert_eq!(stats.acquired.get(), 4);
    drop(allocator);
    assert_eq!(stats.released.get(), 4);
    assert_eq!(stats.live_bytes.get(), 0);
}

#[test]
#[should_panic]
fn test_wrong_count_1() {
    let allocator = SegListAllocator::<u64>::new();
    let p = allocator.allocate(1).unwrap();
    unsafe { allocator.deallocate(p, 100) };
}

#[test]
fn test_allocator_trait_1() {
    let allocator = SegListAllocator::<u8>::new();
    for (size, align) in [(1, 1), (8, 8), (24, 8), (8, 4096), (0, 16), (5000, 64)] {
        let layout = Layout::from_size_align(size, align).unwrap();
        let block = Allocator::allocate(&allocator, layout).unwrap();
        assert_eq!(block.len(), size);
        let p = block.cast::<u8>();
        assert_eq!(p.as_ptr() as usize % align, 0);
        unsafe {
            p.as_ptr().write_bytes(0x11, size);
            Allocator::deallocate(&allocator, p, layout);
        }
    }
}

#[test]
fn test_allocator_trait_2() {
    let (allocator, stats) = limited::<i32>(usize::MAX);
    {
        let mut v: Vec<i32, &Limited<i32>> = Vec::new_in(&allocator);
        for i in 0..100_000 {
            v.push(i);
        }
        assert_eq!(v.len(), 100_000);
        assert!(v.iter().enumerate().all(|(i, &x)| x == i as i32));

        let w: Vec<i32, &Limited<i32>> = {
            let mut w = Vec::with_capacity_in(10, &allocator);
            w.extend(v.iter().filter(|&&x| x % 7 == 0));
            w
        };
        assert_eq!(w.len(), 100_000_usize.div_ceil(7));
    }
    assert!(stats.acquired.get() > 0);
    drop(allocator);
    assert_eq!(stats.live_bytes.get(), 0);
}

#[test]
fn test_allocator_trait_3() {
    let mut v = Vec::new_in(SegListAllocator::<u64>::new());
    v.extend(0..5000_u64);
    let b: Box<[u64], _> = v.into_boxed_slice();
    assert_eq!(b.iter().sum::<u64>(), 5000 * 4999 / 2);
}

#[test]
fn test_mmap_backed_1() {
    let allocator: SegListAllocator<u32, FreeList, ChunkRegistry<MmapSource>> =
        SegListAllocator::with_chunk_manager(ChunkRegistry::with_source(MmapSource::new()));
    let mut rng = StdRng::seed_from_u64(7);
    let mut live = vec![];
    for _ in 0..2000 {
        let n = rng.gen_range(1..3000);
        let p = allocator.allocate(n).unwrap();
        unsafe { p.as_ptr().write_bytes(0xEE, n) };
        live.push((p, n));
    }
    for (p, n) in live {
        unsafe { allocator.deallocate(p, n) };
    }
}
