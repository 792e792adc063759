//! This module provides the raw allocator and its support types.
//!
//! A "raw allocator" is one, that simply gets requests for a specific memory
//! size and hands out blocks aligned to [`ALIGNMENT`](crate::ALIGNMENT). It
//! knows nothing about locking, the platform or logging; that is the job of
//! the [`Allocator`](crate::Allocator) wrapping it.
mod arena;
mod free_list;
mod header;

pub use arena::InitError;
pub use free_list::{Corruption, FreeBlock};
pub use header::{FreeError, ALLOCATED_BIT, HEADER_SIZE};

use crate::align;
use free_list::FreeList;
use header::{BlockSize, Header};

use core::ptr::NonNull;

/// The running counters of a [`RawAllocator`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// The sum of the sizes of all free blocks.
    pub free_bytes_remaining: usize,
    /// The lowest value `free_bytes_remaining` ever had.
    pub minimum_ever_free_bytes_remaining: usize,
    /// The number of allocations, that returned a block.
    pub successful_allocations: usize,
    /// The number of blocks returned to the heap.
    pub successful_frees: usize,
}

/// Compute the size of the block needed to serve a request of `n` bytes.
///
/// The header is added and the sum is rounded up to the alignment. Returns
/// `None` for zero-sized requests, requests colliding with the ownership bit
/// and if any step overflows.
pub const fn block_size_for(n: usize) -> Option<usize> {
    if n == 0 || n & ALLOCATED_BIT != 0 {
        return None;
    }
    match n.checked_add(HEADER_SIZE) {
        Some(needed) => align::align_up(needed),
        None => None,
    }
}

/// A first-fit memory allocator over a single contiguous region.
///
/// The allocator is created empty and set up lazily via [`init()`](Self::init)
/// once the backing region is known.
pub struct RawAllocator {
    free_list: Option<FreeList>,
    counters: Counters,
}
// SAFETY: the raw allocator exclusively owns the memory of its arena. The
// pointers inside are never shared outside of `&mut self`-methods.
unsafe impl Send for RawAllocator {}
impl RawAllocator {
    /// Create a new, uninitialized [`RawAllocator`].
    pub const fn new() -> Self {
        Self {
            free_list: None,
            counters: Counters {
                free_bytes_remaining: 0,
                minimum_ever_free_bytes_remaining: 0,
                successful_allocations: 0,
                successful_frees: 0,
            },
        }
    }

    /// Whether [`init()`](Self::init) already succeeded.
    pub const fn is_initialized(&self) -> bool {
        self.free_list.is_some()
    }

    /// Build the heap on the backing region, if not already done.
    ///
    /// Afterwards there is a single free block spanning the aligned region up
    /// to the end sentinel. Calling this on an initialized allocator does
    /// nothing.
    ///
    /// # Safety
    /// The region of `size` bytes starting at `region` must be valid for reads
    /// and writes for the lifetime of this allocator and must not be used by
    /// anything else.
    pub unsafe fn init(&mut self, region: *mut u8, size: usize) -> Result<(), InitError> {
        if self.is_initialized() {
            return Ok(());
        }

        let arena = arena::Arena::new(region, size)?;
        let free_list = FreeList::new(arena);
        let free = free_list.arena().end().get();
        self.counters.free_bytes_remaining = free;
        self.counters.minimum_ever_free_bytes_remaining = free;
        self.free_list = Some(free_list);
        Ok(())
    }

    /// The size of the single free block right after initialization.
    ///
    /// This is the region size minus the alignment padding and the end
    /// sentinel. Returns `0` before initialization.
    pub fn capacity(&self) -> usize {
        self.free_list
            .as_ref()
            .map_or(0, |list| list.arena().end().get())
    }

    /// Query the running counters.
    pub const fn counters(&self) -> Counters {
        self.counters
    }

    /// Allocate a new memory block for `n` bytes.
    ///
    /// The first free block large enough is used and split if the remainder
    /// is larger than `minimum_block_size`. The returned pointer directly
    /// follows the block header and is aligned to
    /// [`ALIGNMENT`](crate::ALIGNMENT).
    ///
    /// If the allocation fails, `None` will be returned and nothing changes.
    pub fn alloc(&mut self, n: usize, minimum_block_size: usize) -> Option<NonNull<u8>> {
        let needed = block_size_for(n)?;
        if needed > self.counters.free_bytes_remaining {
            return None;
        }

        let free_list = self.free_list.as_mut()?;
        let block = free_list.take_first_fit(needed, minimum_block_size)?;

        // SAFETY: the block was just taken out of the free list, so it is an
        // initialized header inside the arena, that nobody else refers to.
        let size = unsafe { (*block.as_ptr()).size.size() };
        unsafe { block.as_ptr().write(Header::allocated(size)) };

        let counters = &mut self.counters;
        counters.free_bytes_remaining -= size;
        if counters.free_bytes_remaining < counters.minimum_ever_free_bytes_remaining {
            counters.minimum_ever_free_bytes_remaining = counters.free_bytes_remaining;
        }
        counters.successful_allocations += 1;

        Some(free_list.arena().payload(block))
    }

    /// Free a pointer returned by [`alloc()`](Self::alloc).
    ///
    /// Freeing a null pointer does nothing. Otherwise the header in front of
    /// the pointer is validated first: the pointer has to be a payload inside
    /// the arena and the block has to be marked as allocated without a
    /// free-list link. If that is not the case, the error is returned and the
    /// allocator is left untouched. A valid block is put back into the free
    /// list and merged with its free neighbors.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer into the arena, whose block header has
    /// been written by this allocator.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }

        let free_list = self
            .free_list
            .as_mut()
            .ok_or(FreeError::AllocationNotFound)?;
        let arena = free_list.arena();
        let offset = arena.locate(ptr).ok_or(FreeError::AllocationNotFound)?;
        let header = arena.header(offset);

        let size = (*header.as_ptr()).check_allocated()?;
        if size < HEADER_SIZE
            || !align::is_aligned(size)
            || offset.get() + size > arena.end().get()
        {
            return Err(FreeError::CorruptedHeader);
        }

        (*header.as_ptr()).size = BlockSize::free(size);
        self.counters.free_bytes_remaining += size;
        free_list.insert(header);
        self.counters.successful_frees += 1;
        Ok(())
    }

    /// Iterate over the free blocks in ascending address order.
    pub fn free_blocks(&self) -> impl Iterator<Item = FreeBlock> + '_ {
        self.free_list.iter().flat_map(FreeList::iter)
    }

    /// Check the free list against its invariants and the free byte counter.
    ///
    /// An uninitialized allocator is always consistent.
    pub fn check(&self) -> Result<(), Corruption> {
        match &self.free_list {
            Some(free_list) => free_list.check(self.counters.free_bytes_remaining),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::{block_size_for, Counters, FreeError, RawAllocator, ALLOCATED_BIT, HEADER_SIZE};
    use crate::align::ALIGNMENT;
    use crate::platform::Buffer;
    use core::ptr;
    use std::vec::Vec;

    const MIN: usize = 2 * HEADER_SIZE;

    fn raw<const N: usize>(buffer: &Buffer<N>) -> RawAllocator {
        let mut raw = RawAllocator::new();
        unsafe { raw.init(buffer.as_mut_ptr(), N) }.unwrap();
        raw
    }

    #[test]
    fn block_sizes() {
        assert_eq!(block_size_for(0), None);
        assert_eq!(block_size_for(1), Some(HEADER_SIZE + ALIGNMENT));
        assert_eq!(block_size_for(ALIGNMENT), Some(HEADER_SIZE + ALIGNMENT));
        assert_eq!(block_size_for(ALIGNMENT + 1), Some(HEADER_SIZE + 2 * ALIGNMENT));
        assert_eq!(block_size_for(ALLOCATED_BIT), None);
        assert_eq!(block_size_for(usize::MAX), None);
        assert!(block_size_for(ALLOCATED_BIT - 1).is_some());
    }

    #[test]
    fn lazy_initialization() {
        let buffer = Buffer::<1024>::new();
        let mut raw = RawAllocator::new();
        assert!(!raw.is_initialized());
        assert_eq!(raw.capacity(), 0);
        assert_eq!(raw.alloc(8, MIN), None);

        unsafe { raw.init(buffer.as_mut_ptr(), 1024) }.unwrap();
        assert!(raw.is_initialized());
        assert_eq!(raw.capacity(), 1024 - HEADER_SIZE);
        assert_eq!(
            raw.counters(),
            Counters {
                free_bytes_remaining: 1024 - HEADER_SIZE,
                minimum_ever_free_bytes_remaining: 1024 - HEADER_SIZE,
                successful_allocations: 0,
                successful_frees: 0,
            }
        );

        // a second initialization is ignored
        let ptr = raw.alloc(8, MIN).unwrap();
        unsafe { raw.init(buffer.as_mut_ptr(), 1024) }.unwrap();
        assert_eq!(raw.counters().successful_allocations, 1);
        unsafe { raw.free(ptr.as_ptr()) }.unwrap();
    }

    #[test]
    fn allocation_updates_counters() {
        let buffer = Buffer::<1024>::new();
        let mut raw = raw(&buffer);
        let ptr = raw.alloc(100, MIN).unwrap();
        assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(ptr.as_ptr(), buffer.as_mut_ptr().wrapping_add(HEADER_SIZE));

        let used = block_size_for(100).unwrap();
        let counters = raw.counters();
        assert_eq!(counters.free_bytes_remaining, 1024 - HEADER_SIZE - used);
        assert_eq!(counters.minimum_ever_free_bytes_remaining, 1024 - HEADER_SIZE - used);
        assert_eq!(counters.successful_allocations, 1);
        assert_eq!(raw.check(), Ok(()));

        unsafe { raw.free(ptr.as_ptr()) }.unwrap();
        let counters = raw.counters();
        assert_eq!(counters.free_bytes_remaining, 1024 - HEADER_SIZE);
        assert_eq!(counters.minimum_ever_free_bytes_remaining, 1024 - HEADER_SIZE - used);
        assert_eq!(counters.successful_frees, 1);
        assert_eq!(raw.free_blocks().count(), 1);
        assert_eq!(raw.check(), Ok(()));
    }

    #[test]
    fn failed_allocations_change_nothing() {
        let buffer = Buffer::<1024>::new();
        let mut raw = raw(&buffer);
        let before = raw.counters();
        assert_eq!(raw.alloc(0, MIN), None);
        assert_eq!(raw.alloc(1024, MIN), None);
        assert_eq!(raw.alloc(ALLOCATED_BIT, MIN), None);
        assert_eq!(raw.alloc(usize::MAX, MIN), None);
        assert_eq!(raw.alloc(ALLOCATED_BIT - 1, MIN), None);
        assert_eq!(raw.counters(), before);
        assert_eq!(raw.check(), Ok(()));
    }

    #[test]
    fn fragmented_heap_fails_despite_enough_free_bytes() {
        let buffer = Buffer::<1024>::new();
        let mut raw = raw(&buffer);
        let blocks: Vec<_> = (0..6).map(|_| raw.alloc(100, MIN).unwrap()).collect();
        let tail = raw.counters().free_bytes_remaining - HEADER_SIZE;
        let _tail = raw.alloc(tail, MIN).unwrap();
        assert_eq!(raw.counters().free_bytes_remaining, 0);
        for block in blocks.iter().step_by(2) {
            unsafe { raw.free(block.as_ptr()) }.unwrap();
        }
        // three separate holes, none of them large enough for 300 bytes
        let free = raw.counters().free_bytes_remaining;
        assert!(free > 300 + HEADER_SIZE);
        assert_eq!(raw.alloc(300, MIN), None);
        assert_eq!(raw.counters().free_bytes_remaining, free);
        assert_eq!(raw.check(), Ok(()));
    }

    #[test]
    fn double_free_is_rejected() {
        let buffer = Buffer::<1024>::new();
        let mut raw = raw(&buffer);
        let ptr = raw.alloc(16, MIN).unwrap();
        unsafe { raw.free(ptr.as_ptr()) }.unwrap();
        let before = raw.counters();
        assert_eq!(
            unsafe { raw.free(ptr.as_ptr()) },
            Err(FreeError::DoubleFreeDetected)
        );
        assert_eq!(raw.counters(), before);
        assert_eq!(raw.check(), Ok(()));
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let buffer = Buffer::<1024>::new();
        let mut uninitialized = RawAllocator::new();
        let mut value = 0u64;
        let foreign = ptr::addr_of_mut!(value).cast::<u8>();
        assert_eq!(
            unsafe { uninitialized.free(foreign) },
            Err(FreeError::AllocationNotFound)
        );

        let mut raw = raw(&buffer);
        let ptr = raw.alloc(64, MIN).unwrap();
        assert_eq!(unsafe { raw.free(foreign) }, Err(FreeError::AllocationNotFound));
        assert_eq!(
            unsafe { raw.free(ptr.as_ptr().wrapping_add(1)) },
            Err(FreeError::AllocationNotFound)
        );
        assert_eq!(unsafe { raw.free(ptr::null_mut()) }, Ok(()));
        assert_eq!(raw.counters().successful_frees, 0);
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let buffer = Buffer::<1024>::new();
        let mut raw = raw(&buffer);
        let ptr = raw.alloc(64, MIN).unwrap();
        let header = ptr.as_ptr().wrapping_sub(HEADER_SIZE).cast::<usize>();

        // overwrite the (null) free-list link of the allocated block
        unsafe { header.write(header as usize) };
        assert_eq!(
            unsafe { raw.free(ptr.as_ptr()) },
            Err(FreeError::CorruptedHeader)
        );
        assert_eq!(raw.check(), Ok(()));
    }

    #[test]
    fn misaligned_block_size_is_rejected() {
        let buffer = Buffer::<1024>::new();
        let mut raw = raw(&buffer);
        let ptr = raw.alloc(64, MIN).unwrap();
        let size_word = ptr
            .as_ptr()
            .wrapping_sub(HEADER_SIZE - core::mem::size_of::<usize>())
            .cast::<usize>();

        let size = unsafe { size_word.read() };
        unsafe { size_word.write(size + 1) };
        let before = raw.counters();
        assert_eq!(
            unsafe { raw.free(ptr.as_ptr()) },
            Err(FreeError::CorruptedHeader)
        );
        assert_eq!(raw.counters(), before);
        assert_eq!(raw.check(), Ok(()));

        unsafe { size_word.write(size) };
        assert_eq!(unsafe { raw.free(ptr.as_ptr()) }, Ok(()));
    }
}
