//! The services the heap needs from its environment.
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

/// The environment of an [`Allocator`](crate::Allocator).
///
/// The platform provides the backing memory region, the means to run an
/// allocator operation without being interrupted by other tasks and an
/// optional hook for failed allocations.
///
/// # Safety
/// The region reported by [`region_base()`](Self::region_base) and
/// [`region_size()`](Self::region_size) must be valid for reads and writes,
/// must be used exclusively by the heap and must not change for as long as
/// the allocator is in use.
pub unsafe trait Platform {
    /// The start of the backing memory region.
    fn region_base(&self) -> *mut u8;

    /// The number of usable bytes of the backing memory region.
    fn region_size(&self) -> usize;

    /// Prevent all other tasks from running.
    ///
    /// Called on entry of every allocator operation. Interrupts may stay
    /// enabled, but interrupt handlers must not use the heap.
    fn suspend_scheduler(&self) {}

    /// Undo a previous [`suspend_scheduler()`](Self::suspend_scheduler).
    fn resume_scheduler(&self) {}

    /// Called after an allocation of `requested` bytes failed.
    ///
    /// This runs outside of the critical section, but must not use the heap
    /// itself.
    fn allocation_failed(&self, requested: usize) {
        let _ = requested;
    }
}

/// A memory-mapped region at a fixed address, e.g. the window of an external
/// PSRAM chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    base: *mut u8,
    size: usize,
}
impl MappedRegion {
    /// Describe the region of `size` bytes starting at `base`.
    ///
    /// # Safety
    /// The region has to be mapped, readable and writable and must not be
    /// used by anything else than the heap.
    pub const unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }
}
// SAFETY: the region is only a description of memory, which is accessed by the
// allocator under its lock.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}
// SAFETY: guaranteed by the caller of `MappedRegion::new()`
unsafe impl Platform for MappedRegion {
    fn region_base(&self) -> *mut u8 {
        self.base
    }

    fn region_size(&self) -> usize {
        self.size
    }
}

/// Statically sized backing memory for a heap.
///
/// The buffer is completely uninitialized, so a `static` buffer ends up in
/// `.bss` instead of taking up space in flash. A shared reference to a buffer
/// is a [`Platform`]:
/// ```
/// static HEAP: psram_heap::Buffer<4096> = psram_heap::Buffer::new();
/// static ALLOCATOR: psram_heap::Allocator<&psram_heap::Buffer<4096>> =
///     psram_heap::Allocator::new(&HEAP);
/// ```
#[repr(C, align(16))]
pub struct Buffer<const N: usize>(UnsafeCell<[MaybeUninit<u8>; N]>);
impl<const N: usize> Buffer<N> {
    /// Create a new, uninitialized buffer.
    pub const fn new() -> Self {
        Self(UnsafeCell::new([MaybeUninit::uninit(); N]))
    }

    /// The start of the buffer memory.
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }
}
impl<const N: usize> Default for Buffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
// SAFETY: the buffer contents are only accessed through the allocator, which
// serializes all accesses.
unsafe impl<const N: usize> Sync for Buffer<N> {}
// SAFETY: the buffer is borrowed for the whole lifetime of the allocator, so it
// cannot move or be used otherwise.
unsafe impl<const N: usize> Platform for &Buffer<N> {
    fn region_base(&self) -> *mut u8 {
        self.as_mut_ptr()
    }

    fn region_size(&self) -> usize {
        N
    }
}
