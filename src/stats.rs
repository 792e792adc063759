//! Heap usage statistics.
use crate::raw_allocator::{Counters, RawAllocator};

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Copies of the allocator counters, readable without entering the critical
/// section.
///
/// The values are stored at the end of every allocator operation, while the
/// operation still holds the lock. Only plain loads and stores are used, so
/// this works on targets without compare-and-swap.
pub struct Statistics {
    free_bytes_remaining: AtomicUsize,
    minimum_ever_free_bytes_remaining: AtomicUsize,
    successful_allocations: AtomicUsize,
    successful_frees: AtomicUsize,
}
impl Statistics {
    pub const fn new() -> Self {
        Self {
            free_bytes_remaining: AtomicUsize::new(0),
            minimum_ever_free_bytes_remaining: AtomicUsize::new(0),
            successful_allocations: AtomicUsize::new(0),
            successful_frees: AtomicUsize::new(0),
        }
    }

    /// Store the current counters of the raw allocator.
    pub fn publish(&self, counters: &Counters) {
        self.free_bytes_remaining
            .store(counters.free_bytes_remaining, Ordering::Relaxed);
        self.minimum_ever_free_bytes_remaining
            .store(counters.minimum_ever_free_bytes_remaining, Ordering::Relaxed);
        self.successful_allocations
            .store(counters.successful_allocations, Ordering::Relaxed);
        self.successful_frees
            .store(counters.successful_frees, Ordering::Relaxed);
    }

    pub fn free_bytes_remaining(&self) -> usize {
        self.free_bytes_remaining.load(Ordering::Relaxed)
    }

    pub fn minimum_ever_free_bytes_remaining(&self) -> usize {
        self.minimum_ever_free_bytes_remaining.load(Ordering::Relaxed)
    }

    pub fn successful_allocations(&self) -> usize {
        self.successful_allocations.load(Ordering::Relaxed)
    }

    pub fn successful_frees(&self) -> usize {
        self.successful_frees.load(Ordering::Relaxed)
    }
}

/// A consistent snapshot of the heap state.
///
/// Taking the snapshot walks the whole free list, so it is meant for
/// diagnostics, not for hot paths. The [`Display`](fmt::Display)
/// implementation renders a short report suitable for a debug console.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// The total size of the backing region as reported by the platform.
    pub total_region_size: usize,
    /// The sum of the sizes of all free blocks (including their headers).
    pub available_bytes: usize,
    /// The size of the largest free block, `0` if there is none.
    pub largest_free_block: usize,
    /// The size of the smallest free block, `0` if there is none.
    pub smallest_free_block: usize,
    /// The number of blocks in the free list.
    pub number_of_free_blocks: usize,
    /// The lowest amount of free bytes since the heap was set up.
    pub minimum_ever_free_bytes_remaining: usize,
    /// The number of allocations, that returned a block.
    pub successful_allocations: usize,
    /// The number of blocks returned to the heap.
    pub successful_frees: usize,
}
impl HeapStats {
    /// Collect the statistics of a raw allocator.
    pub(crate) fn collect(raw: &RawAllocator, total_region_size: usize) -> Self {
        let counters = raw.counters();
        let mut stats = Self {
            total_region_size,
            available_bytes: counters.free_bytes_remaining,
            minimum_ever_free_bytes_remaining: counters.minimum_ever_free_bytes_remaining,
            successful_allocations: counters.successful_allocations,
            successful_frees: counters.successful_frees,
            ..Self::default()
        };

        for block in raw.free_blocks() {
            stats.largest_free_block = stats.largest_free_block.max(block.size);
            stats.smallest_free_block = match stats.number_of_free_blocks {
                0 => block.size,
                _ => stats.smallest_free_block.min(block.size),
            };
            stats.number_of_free_blocks += 1;
        }
        stats
    }
}
impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "heap: {} bytes total, {} bytes free, {} bytes minimum ever free",
            self.total_region_size, self.available_bytes, self.minimum_ever_free_bytes_remaining
        )?;
        writeln!(
            f,
            "free blocks: {} (largest {} bytes, smallest {} bytes)",
            self.number_of_free_blocks, self.largest_free_block, self.smallest_free_block
        )?;
        write!(
            f,
            "allocations: {}, frees: {}",
            self.successful_allocations, self.successful_frees
        )
    }
}
