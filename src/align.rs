//! Overflow-checked alignment arithmetic.
//!
//! Every place that rounds an address or a size (initialization, splitting,
//! request sizing) goes through these helpers, so there is exactly one
//! implementation of the rounding math.
use core::mem;

/// The alignment of every block header and therefore of every payload.
///
/// This is two machine words: 8 bytes on the 32 bit Cortex-M targets, 16
/// bytes on 64 bit hosts.
pub const ALIGNMENT: usize = 2 * mem::size_of::<usize>();

const MASK: usize = ALIGNMENT - 1;

/// Round `value` up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` if the rounding would overflow a `usize`.
pub const fn align_up(value: usize) -> Option<usize> {
    match value.checked_add(MASK) {
        Some(value) => Some(value & !MASK),
        None => None,
    }
}

/// Round `value` down to the previous multiple of [`ALIGNMENT`].
pub const fn align_down(value: usize) -> usize {
    value & !MASK
}

/// Check whether `value` is a multiple of [`ALIGNMENT`].
pub const fn is_aligned(value: usize) -> bool {
    value & MASK == 0
}
