//! The block header placed in front of every block.
use crate::align;

use core::fmt;
use core::mem;
use core::ptr::NonNull;

/// The size of a [`Header`], rounded up to [`ALIGNMENT`](align::ALIGNMENT).
///
/// The payload directly follows the header, so rounding the header keeps every
/// payload aligned as well.
pub const HEADER_SIZE: usize = match align::align_up(mem::size_of::<Header>()) {
    Some(size) => size,
    None => panic!("header size overflows"),
};

/// The top bit of a `usize`. If set in a [`BlockSize`], the block is owned by
/// the application.
pub const ALLOCATED_BIT: usize = 1 << (usize::BITS - 1);

/// Who owns a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// The block is part of the free list.
    Free,
    /// The block was handed out to the application.
    Allocated,
}

/// The size of a block including its header, with the ownership flag packed
/// into the top bit.
///
/// This keeps the header two words wide, while the flag itself is only ever
/// accessed through [`state()`](Self::state).
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct BlockSize(usize);
impl BlockSize {
    /// A block owned by the allocator.
    ///
    /// # Panics
    /// In debug builds, if `size` collides with the ownership bit.
    pub const fn free(size: usize) -> Self {
        debug_assert!(size & ALLOCATED_BIT == 0, "block size too large");
        Self(size)
    }

    /// A block owned by the application.
    ///
    /// # Panics
    /// In debug builds, if `size` collides with the ownership bit.
    pub const fn allocated(size: usize) -> Self {
        debug_assert!(size & ALLOCATED_BIT == 0, "block size too large");
        Self(size | ALLOCATED_BIT)
    }

    /// The total size of the block in bytes, including its header.
    pub const fn size(self) -> usize {
        self.0 & !ALLOCATED_BIT
    }

    /// Query the ownership of the block.
    pub const fn state(self) -> State {
        if self.0 & ALLOCATED_BIT == 0 {
            State::Free
        } else {
            State::Allocated
        }
    }
}
impl fmt::Debug for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSize")
            .field("size", &self.size())
            .field("state", &self.state())
            .finish()
    }
}

/// An error detected while validating the header of a block to be freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// There is a double-free detected. An already freed-up-block is freed up
    /// again.
    DoubleFreeDetected,
    /// The block is marked as allocated, but still carries a free-list link,
    /// so the header was overwritten.
    CorruptedHeader,
    /// An invalid pointer was freed up (either a pointer outside of the heap
    /// memory or a pointer not aligned like a payload).
    AllocationNotFound,
}
impl fmt::Display for FreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleFreeDetected => f.write_str("double free detected"),
            Self::CorruptedHeader => f.write_str("corrupted block header"),
            Self::AllocationNotFound => f.write_str("pointer was not allocated by this heap"),
        }
    }
}

/// The metadata in front of every block.
///
/// For a free block `next` links to the next free block in ascending address
/// order (or to the end sentinel). For an allocated block `next` is always
/// `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Header {
    pub next: Option<NonNull<Header>>,
    pub size: BlockSize,
}
impl Header {
    /// A free block linked to `next`.
    pub const fn free(size: usize, next: Option<NonNull<Header>>) -> Self {
        Self {
            next,
            size: BlockSize::free(size),
        }
    }

    /// An allocated block.
    pub const fn allocated(size: usize) -> Self {
        Self {
            next: None,
            size: BlockSize::allocated(size),
        }
    }

    /// Check that this header belongs to a block, that may be freed.
    ///
    /// On success the block size (without the ownership flag) is returned.
    pub fn check_allocated(&self) -> Result<usize, FreeError> {
        match (self.size.state(), self.next) {
            (State::Free, _) => Err(FreeError::DoubleFreeDetected),
            (State::Allocated, Some(_)) => Err(FreeError::CorruptedHeader),
            (State::Allocated, None) => Ok(self.size.size()),
        }
    }
}
