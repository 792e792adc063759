//! Heap allocator for large external memory regions
//!
//! This crate provides a single allocator type called [`Allocator`]. It
//! manages one contiguous memory region, typically the memory-mapped window of
//! an external PSRAM chip, independently of the (small) internal heap of the
//! micro-controller. The allocator implements the
//! [`core::alloc::GlobalAlloc`]-trait, but is mostly meant to be used directly
//! via [`Allocator::allocate()`] and [`Allocator::free()`] for large buffers
//! like frame buffers or parsed transactions.
//!
//! # Usage
//! The environment is described by a [`Platform`]: it reports the backing
//! region and suspends the task scheduler while the heap is modified. For a
//! memory-mapped region this looks like this:
//! ```no_run
//! use psram_heap::{Allocator, Platform};
//!
//! struct Psram;
//! unsafe impl Platform for Psram {
//!     fn region_base(&self) -> *mut u8 {
//!         0x0C00_0000 as *mut u8
//!     }
//!
//!     fn region_size(&self) -> usize {
//!         8 * 1024 * 1024
//!     }
//!
//!     fn suspend_scheduler(&self) {
//!         // e.g. `vTaskSuspendAll()`
//!     }
//!
//!     fn resume_scheduler(&self) {
//!         // e.g. `xTaskResumeAll()`
//!     }
//! }
//!
//! static PSRAM_HEAP: Allocator<Psram> = Allocator::new(Psram);
//!
//! let buffer = PSRAM_HEAP.allocate(320 * 240 * 2).expect("out of PSRAM");
//! // ...
//! unsafe { PSRAM_HEAP.free(buffer.as_ptr()) };
//! ```
//! The heap is set up lazily on the first allocation, so the region does not
//! need to be accessible before that (e.g. before the memory controller is
//! configured).
//!
//! # Implementation
//! Every block of the heap is prefixed with a header of two words: the size of
//! the block (including the header) and a link. The top bit of the size is the
//! ownership flag: set means the block belongs to the application, clear means
//! it belongs to the allocator. The free blocks form a singly linked list in
//! ascending address order, terminated by a zero-sized end marker at the top of
//! the region.
//! 1.  Right after setting up the heap, there is a single free block:
//!     ```text
//!     hhhh 0000 0000 0000 0000 0000 0000 0000 0000 0000 0000 0000 eeee
//!     ^-----------------------------------------------------------^---
//!     FREE                                                        END
//!     ```
//! 2.  An allocation takes the first free block, that is large enough. If the
//!     block is larger than needed by more than the minimum block size (see
//!     [`Config`]), the tail is split off as a new free block:
//!     ```text
//!     hhhh 0000 0000 hhhh 0000 0000 0000 0000 0000 0000 0000 0000 eeee
//!     ^------------- ^--------------------------------------------^---
//!     USED           FREE                                         END
//!     ```
//!     Otherwise the whole block is handed out, wasting a few bytes.
//! 3.  Freeing a block puts it back into the list at its address. If the free
//!     block before it ends exactly where the freed block starts, the two are
//!     merged; the same happens with the free block after it. Therefore there
//!     are never two adjacent free blocks:
//!     ```text
//!     hhhh 0000 0000 hhhh 0000 hhhh 0000 0000 0000 0000 0000 0000 eeee
//!     ^------------- ^------------- ^-----------------------------^---
//!     USED           USED           FREE                          END
//!
//!     hhhh 0000 0000 hhhh 0000 hhhh 0000 0000 0000 0000 0000 0000 eeee
//!     ^------------- ^--------------------------------------------^---
//!     USED           FREE (merged with the following block)       END
//!     ```
//! 4.  An allocated block always has a null link. Freeing a block, that is not
//!     marked as allocated or that has a link, is a double free or a corrupted
//!     heap. This is not recoverable, the allocator panics.
//!
//! All operations run with the scheduler suspended (see
//! [`Platform::suspend_scheduler()`]) and additionally hold a spin lock. They
//! never wait for memory to become available: a request, that cannot be
//! served, fails immediately. The allocator must not be used from interrupt
//! handlers.
#![no_std]

mod align;
mod config;
mod critical;
mod platform;
mod raw_allocator;
mod stats;

pub use align::ALIGNMENT;
pub use config::Config;
pub use platform::{Buffer, MappedRegion, Platform};
pub use raw_allocator::{Corruption, FreeError, InitError, HEADER_SIZE};
pub use stats::HeapStats;

use critical::CriticalSection;
use raw_allocator::RawAllocator;
use stats::Statistics;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};

/// The heap allocator for an external memory region.
///
/// This is the core type of this crate: a first-fit allocator with immediate
/// coalescing of free blocks over the region described by its [`Platform`].
/// The allocator is usable in `const`-contexts, so it is typically put into a
/// `static`:
/// ```
/// static HEAP: psram_heap::Buffer<4096> = psram_heap::Buffer::new();
/// static ALLOCATOR: psram_heap::Allocator<&psram_heap::Buffer<4096>> =
///     psram_heap::Allocator::new(&HEAP);
///
/// let ptr = ALLOCATOR.allocate(100).unwrap();
/// assert_eq!(ptr.as_ptr() as usize % psram_heap::ALIGNMENT, 0);
/// unsafe { ALLOCATOR.free(ptr.as_ptr()) };
/// ```
/// Also please refer to the [crate-level](crate)-documentation for the
/// algorithm and general usage.
pub struct Allocator<P: Platform> {
    platform: P,
    config: Config,
    raw: spin::Mutex<RawAllocator>,
    statistics: Statistics,
    logging: AtomicBool,
}
impl<P: Platform> Allocator<P> {
    /// Create a new [`Allocator`] with the default [`Config`].
    ///
    /// This function is a `const fn`, therefore you can call it directly when
    /// creating the allocator. The region of the platform is not touched until
    /// the first allocation.
    #[must_use = "assign the allocator to a static variable to use it as the heap"]
    pub const fn new(platform: P) -> Self {
        Self::with_config(platform, Config::new())
    }

    /// Create a new [`Allocator`] with a custom [`Config`].
    #[must_use = "assign the allocator to a static variable to use it as the heap"]
    pub const fn with_config(platform: P, config: Config) -> Self {
        Self {
            platform,
            config,
            raw: spin::Mutex::new(RawAllocator::new()),
            statistics: Statistics::new(),
            logging: AtomicBool::new(false),
        }
    }

    /// Query the configuration of this allocator.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// The returned pointer is aligned to [`ALIGNMENT`]. On the very first call
    /// the heap is set up on the platform region.
    ///
    /// `None` is returned if `size` is zero, if there is no free block large
    /// enough or if the heap could not be set up. In that case
    /// [`Platform::allocation_failed()`] is called and the heap is left
    /// unchanged.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let (initialization, block) = {
            let _section = CriticalSection::enter(&self.platform);
            let mut raw = self.raw.lock();

            let initialization = if raw.is_initialized() {
                None
            } else {
                let base = self.platform.region_base();
                // SAFETY: the `Platform` contract guarantees an exclusively
                // owned, valid region
                let result = unsafe { raw.init(base, self.platform.region_size()) };
                Some(result.map(|()| (base, raw.capacity())))
            };
            let block = raw.alloc(size, self.config.get_minimum_block_size());
            self.statistics.publish(&raw.counters());
            (initialization, block)
        };

        self.report(|| {
            match initialization {
                Some(Ok((base, capacity))) => {
                    log::debug!("heap set up at {:p} with {} free bytes", base, capacity);
                }
                Some(Err(error)) => log::error!("cannot set up heap: {}", error),
                None => {}
            }
            match block {
                Some(ptr) => log::trace!("allocated {} bytes at {:p}", size, ptr),
                None => log::warn!(
                    "failed to allocate {} bytes ({} bytes free)",
                    size,
                    self.free_bytes_remaining()
                ),
            }
        });
        if block.is_none() {
            self.platform.allocation_failed(size);
        }
        block
    }

    /// Return a block to the heap.
    ///
    /// Freeing a null pointer does nothing. The freed block is merged with its
    /// free neighbors.
    ///
    /// # Panics
    /// This function panics if the block header is not consistent, i.e. on a
    /// double free, on a pointer not allocated by this heap or on a corrupted
    /// header. Continuing in such a case would hand out memory, that is still
    /// in use.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer returned by [`allocate()`] of this
    /// allocator, that was not freed since. The memory must not be used
    /// afterwards.
    ///
    /// [`allocate()`]: Self::allocate
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let result = {
            let _section = CriticalSection::enter(&self.platform);
            let mut raw = self.raw.lock();
            let result = raw.free(ptr);
            self.statistics.publish(&raw.counters());
            result
        };

        if let Err(error) = result {
            self.report(|| {
                log::error!("heap corruption detected while freeing {:p}: {}", ptr, error);
            });
            panic!("heap corruption detected while freeing {:p}: {}", ptr, error);
        }
        self.report(|| log::trace!("freed {:p}", ptr));
    }

    /// Emit log records, unless this allocator is already logging.
    ///
    /// The logger may allocate from this very heap. Records of those nested
    /// calls are dropped, otherwise every record would cause another one.
    /// Only loads and stores are used, so a record of another thread may be
    /// dropped as well while a record is being written.
    fn report(&self, records: impl FnOnce()) {
        if self.logging.load(Ordering::Acquire) {
            return;
        }
        self.logging.store(true, Ordering::Release);
        records();
        self.logging.store(false, Ordering::Release);
    }

    /// The number of bytes currently free, including the block headers.
    ///
    /// This reads a copy of the counter and does not lock the heap.
    pub fn free_bytes_remaining(&self) -> usize {
        self.statistics.free_bytes_remaining()
    }

    /// The lowest value [`free_bytes_remaining()`] ever had.
    ///
    /// [`free_bytes_remaining()`]: Self::free_bytes_remaining
    pub fn minimum_ever_free_bytes_remaining(&self) -> usize {
        self.statistics.minimum_ever_free_bytes_remaining()
    }

    /// The size of the backing region as reported by the platform.
    pub fn total_region_size(&self) -> usize {
        self.platform.region_size()
    }

    /// The number of successful allocations.
    pub fn successful_allocations(&self) -> usize {
        self.statistics.successful_allocations()
    }

    /// The number of successful frees.
    pub fn successful_frees(&self) -> usize {
        self.statistics.successful_frees()
    }

    /// Take a snapshot of the heap usage.
    ///
    /// This walks the whole free list inside the critical section.
    pub fn heap_stats(&self) -> HeapStats {
        let _section = CriticalSection::enter(&self.platform);
        let raw = self.raw.lock();
        HeapStats::collect(&raw, self.platform.region_size())
    }

    /// Verify the internal consistency of the heap.
    ///
    /// The free list is walked and checked for ordering, merged neighbors,
    /// valid links and sizes and whether the free byte counter matches. The
    /// first violation is returned. A heap, that is not yet set up, is always
    /// consistent.
    pub fn check_integrity(&self) -> Result<(), Corruption> {
        let _section = CriticalSection::enter(&self.platform);
        let raw = self.raw.lock();
        raw.check()
    }
}
unsafe impl<P: Platform> GlobalAlloc for Allocator<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            self.report(|| log::warn!("unsupported alignment of {} bytes", layout.align()));
            return ptr::null_mut();
        }
        self.allocate(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr);
    }
}
