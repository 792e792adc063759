use crate::raw_allocator::HEADER_SIZE;

/// Tunable parameters of an [`Allocator`](crate::Allocator).
///
/// All setters are `const fn`s, so a configuration can be built right inside
/// the initializer of a `static` allocator:
/// ```
/// use psram_heap::{Allocator, Buffer, Config};
///
/// static HEAP: Buffer<4096> = Buffer::new();
/// static ALLOCATOR: Allocator<&Buffer<4096>> =
///     Allocator::with_config(&HEAP, Config::new().minimum_block_size(128));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    minimum_block_size: usize,
}
impl Config {
    /// The default split threshold: two block headers.
    pub const DEFAULT_MINIMUM_BLOCK_SIZE: usize = 2 * HEADER_SIZE;

    /// Create the default configuration.
    pub const fn new() -> Self {
        Self {
            minimum_block_size: Self::DEFAULT_MINIMUM_BLOCK_SIZE,
        }
    }

    /// Set the split threshold.
    ///
    /// A free block is only split on allocation if more than `size` bytes
    /// would remain. Otherwise the whole block is handed out, wasting at most
    /// `size` bytes. Larger values mean less splitting and merging work but
    /// more internal fragmentation.
    ///
    /// # Panics
    /// This function panics if `size` is smaller than a block header, as the
    /// split-off block must be able to hold its own header.
    #[must_use]
    pub const fn minimum_block_size(mut self, size: usize) -> Self {
        assert!(
            size >= HEADER_SIZE,
            "minimum block size must be able to hold a block header"
        );
        self.minimum_block_size = size;
        self
    }

    /// Query the split threshold.
    pub const fn get_minimum_block_size(&self) -> usize {
        self.minimum_block_size
    }
}
impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
