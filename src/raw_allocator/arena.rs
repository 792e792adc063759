use super::header::{Header, ALLOCATED_BIT, HEADER_SIZE};
use crate::align::{self, ALIGNMENT};

use core::fmt;
use core::ptr::NonNull;

/// The smallest possible first block: a header and one aligned payload unit.
pub const MINIMUM_FIRST_BLOCK: usize = HEADER_SIZE + ALIGNMENT;

/// An error occurred when setting up the heap on the backing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The region base address is null.
    NullBase,
    /// After aligning, the region cannot hold the end sentinel and a single
    /// non-empty block.
    RegionTooSmall {
        /// The size reported by the platform.
        size: usize,
    },
    /// The region is so large, that the size of a block would collide with
    /// the ownership flag.
    RegionTooLarge {
        /// The size reported by the platform.
        size: usize,
    },
}
impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullBase => f.write_str("heap region starts at null"),
            Self::RegionTooSmall { size } => write!(
                f,
                "heap region of {} bytes is too small (minimum is {} usable bytes)",
                size,
                MINIMUM_FIRST_BLOCK + HEADER_SIZE
            ),
            Self::RegionTooLarge { size } => {
                write!(f, "heap region of {} bytes exceeds the maximum block size", size)
            }
        }
    }
}

/// An offset into the [`Arena`], that is validated and known to be safe.
///
/// A validated offset is aligned and leaves room for a full [`Header`] before
/// the end of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValidatedOffset(usize);
impl ValidatedOffset {
    /// The raw byte offset from the start of the arena.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// The aligned part of the backing region, that holds the blocks.
///
/// The arena spans from the aligned region base up to and including the end
/// sentinel. All conversions between addresses and block headers happen here.
#[derive(Debug)]
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
}
impl Arena {
    /// Carve the arena out of a backing region.
    ///
    /// The base is rounded up to [`ALIGNMENT`] and the size reduced by the
    /// skipped bytes. The end sentinel is placed at the highest aligned address
    /// that leaves room for a header.
    pub fn new(region: *mut u8, size: usize) -> Result<Self, InitError> {
        let region = NonNull::new(region).ok_or(InitError::NullBase)?;
        let too_small = InitError::RegionTooSmall { size };

        let address = region.as_ptr() as usize;
        let skipped = align::align_up(address).ok_or(too_small)? - address;
        let usable = size.checked_sub(skipped).ok_or(too_small)?;
        // the base is aligned, so aligning the offset aligns the address
        let end = align::align_down(usable.checked_sub(HEADER_SIZE).ok_or(too_small)?);
        if end < MINIMUM_FIRST_BLOCK {
            return Err(too_small);
        }
        if end & ALLOCATED_BIT != 0 {
            return Err(InitError::RegionTooLarge { size });
        }

        let base = NonNull::new(region.as_ptr().wrapping_add(skipped)).ok_or(too_small)?;
        Ok(Self {
            base,
            len: end + HEADER_SIZE,
        })
    }

    /// The offset of the first block.
    pub const fn first(&self) -> ValidatedOffset {
        ValidatedOffset(0)
    }

    /// The offset of the end sentinel.
    pub const fn end(&self) -> ValidatedOffset {
        ValidatedOffset(self.len - HEADER_SIZE)
    }

    /// Validate a raw byte offset.
    ///
    /// Only aligned offsets up to (and including) the end sentinel are valid.
    pub fn validate(&self, offset: usize) -> Option<ValidatedOffset> {
        (align::is_aligned(offset) && offset <= self.end().0).then(|| ValidatedOffset(offset))
    }

    /// Obtain the header at a [`ValidatedOffset`].
    ///
    /// The memory behind the pointer is not necessarily initialized.
    pub fn header(&self, offset: ValidatedOffset) -> NonNull<Header> {
        debug_assert!(offset.0 <= self.end().0);

        // SAFETY: the validated offset lies inside the arena, which is part of
        // the backing region, so the pointer stays in bounds and is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset.0)).cast() }
    }

    /// Obtain the offset of a header inside of the arena.
    ///
    /// Returns `None` if the header does not lie inside the arena or is not
    /// aligned.
    pub fn offset_of(&self, header: NonNull<Header>) -> Option<ValidatedOffset> {
        let offset = (header.as_ptr() as usize).checked_sub(self.base.as_ptr() as usize)?;
        self.validate(offset)
    }

    /// Find the block header belonging to a payload pointer.
    ///
    /// This fails for pointers outside of the arena, for misaligned pointers
    /// and for the (payload-less) end sentinel.
    pub fn locate(&self, payload: *mut u8) -> Option<ValidatedOffset> {
        let start = (self.base.as_ptr() as usize).checked_add(HEADER_SIZE)?;
        let offset = (payload as usize).checked_sub(start)?;
        let offset = self.validate(offset)?;
        (offset < self.end()).then(|| offset)
    }

    /// The payload address of the block at `header`.
    pub fn payload(&self, header: NonNull<Header>) -> NonNull<u8> {
        // SAFETY: every block header is followed by at least the end sentinel,
        // so skipping one header stays in bounds of the arena.
        unsafe { NonNull::new_unchecked(header.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
    }
}
