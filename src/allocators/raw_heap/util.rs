//! Utility functions specific to the [`RawHeap`](super::RawHeap) allocator.

use std::alloc::Layout;

use crate::header::PAYLOAD_ALIGN;
use crate::util::round_up;

/// Smallest payload handed out, a zero sized request is served as this.
pub const MIN_REQUEST: usize = 1;

/// Space reserved in front of an over-aligned object for the pointer back to its block payload.
pub const BACK_POINTER_SIZE: usize = core::mem::size_of::<*mut u8>();

/// Augments `size` to a payload size that can be used for an allocation
/// or returns `Err(())` if the size can not be augmented.
///
/// Payload sizes are multiples of [`PAYLOAD_ALIGN`] so that the header of the following
/// block stays aligned.
#[inline]
pub fn augment_size(size: usize) -> Result<usize, ()> {
    // Size of objects should not exceed isize::MAX.
    // https://doc.rust-lang.org/std/ptr/index.html#allocated-object
    match round_up(size.max(MIN_REQUEST), PAYLOAD_ALIGN) {
        Some(new_size) if new_size as isize > 0 => Ok(new_size),
        _ => Err(()),
    }
}

/// Returns the payload size needed to place an object of `layout` at an aligned address
/// with a back pointer in front of it, or `Err(())` if the layout is not over-aligned
/// or the size overflows.
#[inline]
pub fn padded_size(layout: Layout) -> Result<usize, ()> {
    if layout.align() <= PAYLOAD_ALIGN {
        return Err(());
    }
    // A payload is PAYLOAD_ALIGN aligned, so the first aligned address past the back
    // pointer is at most `align` bytes in.
    layout.size().checked_add(layout.align()).ok_or(())
}
