//! The address-ordered list of free blocks.
//!
//! The list is threaded through the `next` fields of the free blocks. It starts
//! at the `start` sentinel, which is not part of the arena, and is terminated
//! by the zero-sized `end` sentinel at the top of the arena. Free blocks are
//! kept in strictly ascending address order and adjacent free blocks are
//! always merged, so there is never more than one free block covering a run
//! of contiguous free memory.
use super::arena::{Arena, ValidatedOffset};
use super::header::{BlockSize, Header, State, HEADER_SIZE};

use core::fmt;
use core::ptr::NonNull;

/// A violation of the free list invariants found by [`FreeList::check()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// A link points outside of the arena, to a misaligned address or past
    /// the end sentinel.
    LinkOutOfArena {
        /// The address the link points to.
        address: usize,
    },
    /// The list does not terminate at the end sentinel.
    MissingEnd,
    /// A block in the free list is marked as allocated.
    NotFree {
        /// The arena offset of the offending block.
        offset: usize,
    },
    /// A block is smaller than a header or reaches past the end sentinel.
    InvalidSize {
        /// The arena offset of the offending block.
        offset: usize,
    },
    /// A block starts before its predecessor in the list ends.
    Unordered {
        /// The arena offset of the offending block.
        offset: usize,
    },
    /// A block directly follows its predecessor without being merged.
    Uncoalesced {
        /// The arena offset of the offending block.
        offset: usize,
    },
    /// The sum of all free blocks does not match the free byte counter.
    Accounting {
        /// The value of the free byte counter.
        expected: usize,
        /// The sum of all free blocks in the list.
        actual: usize,
    },
}
impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkOutOfArena { address } => {
                write!(f, "free list links to {:#x} outside of the heap", address)
            }
            Self::MissingEnd => f.write_str("free list is not terminated by the end marker"),
            Self::NotFree { offset } => write!(f, "allocated block in free list at +{:#x}", offset),
            Self::InvalidSize { offset } => write!(f, "free block at +{:#x} has an invalid size", offset),
            Self::Unordered { offset } => {
                write!(f, "free block at +{:#x} overlaps its predecessor", offset)
            }
            Self::Uncoalesced { offset } => {
                write!(f, "free block at +{:#x} was not merged with its predecessor", offset)
            }
            Self::Accounting { expected, actual } => write!(
                f,
                "free byte counter is {} but the free list holds {} bytes",
                expected, actual
            ),
        }
    }
}

/// Read the total size of a block.
///
/// # Safety
/// `header` must point to an initialized [`Header`].
unsafe fn size_of(header: NonNull<Header>) -> usize {
    (*header.as_ptr()).size.size()
}

fn address(header: NonNull<Header>) -> usize {
    header.as_ptr() as usize
}

/// The free list over a single [`Arena`].
pub struct FreeList {
    arena: Arena,
    start: Header,
    end: NonNull<Header>,
}
impl FreeList {
    /// Set up the free list with a single free block spanning the whole arena.
    ///
    /// # Safety
    /// The memory of the arena must be valid for reads and writes and must not
    /// be accessed by anything else than this free list and the owners of the
    /// blocks it hands out.
    pub unsafe fn new(arena: Arena) -> Self {
        let end = arena.header(arena.end());
        end.as_ptr().write(Header::free(0, None));

        let first = arena.header(arena.first());
        first
            .as_ptr()
            .write(Header::free(arena.end().get(), Some(end)));

        Self {
            arena,
            start: Header::free(0, Some(first)),
            end,
        }
    }

    /// The arena managed by this list.
    pub const fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Remove the first block with a size of at least `needed` bytes.
    ///
    /// The blocks are visited in ascending address order and the first block
    /// large enough is taken (first fit). If the block is larger than `needed`
    /// by more than `minimum_block_size`, the tail is split off and put back
    /// into the list. The returned block is unlinked, but still marked as free;
    /// its size is either exactly `needed` or the size of the whole block.
    ///
    /// `needed` must be aligned and at least [`HEADER_SIZE`].
    pub fn take_first_fit(
        &mut self,
        needed: usize,
        minimum_block_size: usize,
    ) -> Option<NonNull<Header>> {
        debug_assert!(needed >= HEADER_SIZE);
        let end = self.end;

        // SAFETY: every link reachable from `start` points to an initialized
        // header inside the arena (list invariant). The split point is derived
        // via the arena and lies inside the block being split.
        unsafe {
            let mut previous = NonNull::from(&mut self.start);
            let mut block = (*previous.as_ptr()).next?;
            while size_of(block) < needed {
                match (*block.as_ptr()).next {
                    Some(next) => {
                        previous = block;
                        block = next;
                    }
                    None => break,
                }
            }
            // a list ending early is corrupted and cannot serve the request
            let size = size_of(block);
            if block == end || size < needed {
                return None;
            }

            let remainder = if size - needed > minimum_block_size {
                let offset = self.arena.offset_of(block)?.get() + needed;
                Some(self.arena.header(self.arena.validate(offset)?))
            } else {
                None
            };

            (*previous.as_ptr()).next = (*block.as_ptr()).next;

            if let Some(remainder) = remainder {
                remainder
                    .as_ptr()
                    .write(Header::free(size - needed, None));
                (*block.as_ptr()).size = BlockSize::free(needed);
                self.insert(remainder);
            }
            Some(block)
        }
    }

    /// Insert a free block into the list, merging it with its neighbors.
    ///
    /// The block is merged with the preceding free block if that one ends
    /// exactly where `block` starts, and with the following free block if
    /// `block` ends exactly where that one starts. The end sentinel is never
    /// merged.
    ///
    /// # Safety
    /// `block` must point to an initialized header inside the arena, that is
    /// marked as free, is not yet part of the list and does not overlap any
    /// other free block.
    pub unsafe fn insert(&mut self, block: NonNull<Header>) {
        let end = self.end;
        let start = NonNull::from(&mut self.start);

        let mut iterator = start;
        while let Some(next) = (*iterator.as_ptr()).next {
            if next >= block {
                break;
            }
            iterator = next;
        }

        let mut block = block;
        if iterator != start && address(iterator) + size_of(iterator) == address(block) {
            (*iterator.as_ptr()).size = BlockSize::free(size_of(iterator) + size_of(block));
            block = iterator;
        }

        let successor = (*iterator.as_ptr()).next;
        (*block.as_ptr()).next = match successor {
            Some(next) if next != end && address(block) + size_of(block) == address(next) => {
                (*block.as_ptr()).size = BlockSize::free(size_of(block) + size_of(next));
                (*next.as_ptr()).next
            }
            _ => successor,
        };

        // a block merged backwards already sits in the list
        if iterator != block {
            (*iterator.as_ptr()).next = Some(block);
        }
    }

    /// Iterate over all free blocks in ascending address order.
    pub fn iter(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            list: self,
            next: self.start.next,
        }
    }

    /// Verify the free list invariants.
    ///
    /// The list is walked from `start` to `end` and every node is checked
    /// before it is read: it has to lie inside the arena, be marked as free,
    /// start after its predecessor ended (with a gap, otherwise the two
    /// blocks should have been merged) and fit below the end sentinel.
    /// Finally the sizes have to add up to `free_bytes`.
    pub fn check(&self, free_bytes: usize) -> Result<(), Corruption> {
        let end = self.arena.end();
        let mut total = 0usize;
        let mut previous_end = None;
        let mut link = self.start.next;
        loop {
            let header = link.ok_or(Corruption::MissingEnd)?;
            if header == self.end {
                break;
            }
            let out_of_arena = Corruption::LinkOutOfArena {
                address: address(header),
            };
            let offset = self.arena.offset_of(header).ok_or(out_of_arena)?;
            if offset >= end {
                return Err(out_of_arena);
            }
            if let Some(previous_end) = previous_end {
                if offset.get() < previous_end {
                    return Err(Corruption::Unordered {
                        offset: offset.get(),
                    });
                }
                if offset.get() == previous_end {
                    return Err(Corruption::Uncoalesced {
                        offset: offset.get(),
                    });
                }
            }

            // SAFETY: the offset was validated to lie inside the arena, every
            // header inside the arena was written by the allocator.
            let block = unsafe { header.as_ptr().read() };
            if block.size.state() != State::Free {
                return Err(Corruption::NotFree {
                    offset: offset.get(),
                });
            }
            let size = block.size.size();
            let block_end = offset.get() + size;
            if size < HEADER_SIZE || block_end > end.get() {
                return Err(Corruption::InvalidSize {
                    offset: offset.get(),
                });
            }

            total += size;
            previous_end = Some(block_end);
            link = block.next;
        }

        if total == free_bytes {
            Ok(())
        } else {
            Err(Corruption::Accounting {
                expected: free_bytes,
                actual: total,
            })
        }
    }
}

/// A free block yielded by [`FreeBlocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// The offset of the block header from the start of the arena.
    pub offset: ValidatedOffset,
    /// The size of the block including its header.
    pub size: usize,
}

/// Iterator over the free blocks of a [`FreeList`].
pub struct FreeBlocks<'list> {
    list: &'list FreeList,
    next: Option<NonNull<Header>>,
}
impl<'list> Iterator for FreeBlocks<'list> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.next?;
        if header == self.list.end {
            return None;
        }
        let offset = self.list.arena.offset_of(header)?;

        // SAFETY: the list invariant guarantees initialized headers inside
        // the arena for every node
        let block = unsafe { header.as_ptr().read() };
        self.next = block.next;
        Some(FreeBlock {
            offset,
            size: block.size.size(),
        })
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::{Corruption, FreeBlock, FreeList};
    use crate::platform::Buffer;
    use crate::raw_allocator::arena::Arena;
    use crate::raw_allocator::header::{BlockSize, HEADER_SIZE};
    use std::vec::Vec;

    const MIN: usize = 2 * HEADER_SIZE;

    fn free_list<const N: usize>(buffer: &Buffer<N>) -> FreeList {
        let arena = Arena::new(buffer.as_mut_ptr(), N).unwrap();
        unsafe { FreeList::new(arena) }
    }

    fn blocks(list: &FreeList) -> Vec<(usize, usize)> {
        list.iter()
            .map(|FreeBlock { offset, size }| (offset.get(), size))
            .collect()
    }

    #[test]
    fn initial_state() {
        let buffer = Buffer::<1024>::new();
        let list = free_list(&buffer);
        assert_eq!(blocks(&list), [(0, 1024 - HEADER_SIZE)]);
        assert_eq!(list.check(1024 - HEADER_SIZE), Ok(()));
    }

    #[test]
    fn split_on_take() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        let block = list.take_first_fit(128, MIN).unwrap();
        assert_eq!(list.arena().offset_of(block).unwrap().get(), 0);
        assert_eq!(unsafe { block.as_ref() }.size, BlockSize::free(128));
        assert_eq!(blocks(&list), [(128, 1024 - HEADER_SIZE - 128)]);
    }

    #[test]
    fn no_split_for_small_remainders() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        let whole = 1024 - HEADER_SIZE;
        let block = list.take_first_fit(whole - MIN, MIN).unwrap();
        assert_eq!(unsafe { block.as_ref() }.size.size(), whole);
        assert!(blocks(&list).is_empty());
        assert_eq!(list.check(0), Ok(()));
        assert!(list.take_first_fit(HEADER_SIZE, MIN).is_none());
    }

    #[test]
    fn take_fails_without_fitting_block() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        assert!(list.take_first_fit(1024, MIN).is_none());
        assert_eq!(blocks(&list), [(0, 1024 - HEADER_SIZE)]);
    }

    #[test]
    fn first_fit_prefers_lowest_address() {
        let buffer = Buffer::<2048>::new();
        let mut list = free_list(&buffer);
        let a = list.take_first_fit(64, MIN).unwrap();
        let _guard1 = list.take_first_fit(64, MIN).unwrap();
        let b = list.take_first_fit(208, MIN).unwrap();
        let _guard2 = list.take_first_fit(64, MIN).unwrap();
        let c = list.take_first_fit(64, MIN).unwrap();
        let _guard3 = list.take_first_fit(64, MIN).unwrap();
        unsafe {
            list.insert(b);
            list.insert(c);
            list.insert(a);
        }
        assert_eq!(
            blocks(&list)[..3],
            [(0, 64), (128, 208), (400, 64)]
        );

        let taken = list.take_first_fit(64, MIN).unwrap();
        assert_eq!(taken, a);
        let taken = list.take_first_fit(64, MIN).unwrap();
        assert_eq!(list.arena().offset_of(taken).unwrap().get(), 128);
    }

    #[test]
    fn coalescing() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        let a = list.take_first_fit(64, MIN).unwrap();
        let b = list.take_first_fit(64, MIN).unwrap();
        let c = list.take_first_fit(64, MIN).unwrap();
        let d = list.take_first_fit(64, MIN).unwrap();
        let rest = 1024 - HEADER_SIZE - 256;
        assert_eq!(blocks(&list), [(256, rest)]);

        // no neighbor is free
        unsafe { list.insert(b) };
        assert_eq!(blocks(&list), [(64, 64), (256, rest)]);
        // backward merge with b
        unsafe { list.insert(c) };
        assert_eq!(blocks(&list), [(64, 128), (256, rest)]);
        // forward merge with b
        unsafe { list.insert(a) };
        assert_eq!(blocks(&list), [(0, 192), (256, rest)]);
        // merge in both directions
        unsafe { list.insert(d) };
        assert_eq!(blocks(&list), [(0, 1024 - HEADER_SIZE)]);
        assert_eq!(list.check(1024 - HEADER_SIZE), Ok(()));
    }

    #[test]
    fn end_sentinel_is_never_merged() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        let whole = list.take_first_fit(1024 - HEADER_SIZE, MIN).unwrap();
        assert!(blocks(&list).is_empty());
        unsafe { list.insert(whole) };
        assert_eq!(blocks(&list), [(0, 1024 - HEADER_SIZE)]);
        assert_eq!(list.check(1024 - HEADER_SIZE), Ok(()));
    }

    #[test]
    fn check_detects_accounting_errors() {
        let buffer = Buffer::<1024>::new();
        let list = free_list(&buffer);
        assert_eq!(
            list.check(42),
            Err(Corruption::Accounting {
                expected: 42,
                actual: 1024 - HEADER_SIZE
            })
        );
    }

    #[test]
    fn check_detects_allocated_blocks() {
        let buffer = Buffer::<1024>::new();
        let list = free_list(&buffer);
        let first = list.arena().header(list.arena().first());
        unsafe { (*first.as_ptr()).size = BlockSize::allocated(1024 - HEADER_SIZE) };
        assert_eq!(
            list.check(1024 - HEADER_SIZE),
            Err(Corruption::NotFree { offset: 0 })
        );
    }

    #[test]
    fn check_detects_unmerged_neighbors() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        let a = list.take_first_fit(64, MIN).unwrap();
        // link `a` in front of its free neighbor without merging them
        unsafe {
            (*a.as_ptr()).next = list.start.next;
            list.start.next = Some(a);
        }
        assert_eq!(
            list.check(1024 - HEADER_SIZE),
            Err(Corruption::Uncoalesced { offset: 64 })
        );
    }

    #[test]
    fn check_detects_wild_links() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        let first = list.arena().header(list.arena().first());
        let wild = list.arena().header(list.arena().validate(512).unwrap());
        unsafe {
            (*first.as_ptr()).size = BlockSize::free(64);
            (*first.as_ptr()).next = Some(first);
        }
        assert_eq!(list.check(64), Err(Corruption::Unordered { offset: 0 }));

        let misaligned = wild.as_ptr().cast::<u8>().wrapping_add(1).cast();
        unsafe { (*first.as_ptr()).next = core::ptr::NonNull::new(misaligned) };
        assert!(matches!(
            list.check(64),
            Err(Corruption::LinkOutOfArena { .. })
        ));

        list.start.next = None;
        assert_eq!(list.check(0), Err(Corruption::MissingEnd));
    }

    #[test]
    fn take_stops_at_a_truncated_list() {
        let buffer = Buffer::<1024>::new();
        let mut list = free_list(&buffer);
        let first = list.arena().header(list.arena().first());
        unsafe {
            (*first.as_ptr()).size = BlockSize::free(64);
            (*first.as_ptr()).next = None;
        }
        assert_eq!(list.check(64), Err(Corruption::MissingEnd));

        assert!(list.take_first_fit(128, MIN).is_none());
        assert_eq!(blocks(&list), [(0, 64)]);
        assert!(list.take_first_fit(64, MIN).is_some());
    }
}
