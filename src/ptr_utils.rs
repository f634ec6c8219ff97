//! Generic utilities for pointer handling and sizing.

use core::ptr::NonNull;

/// Aligns `ptr` up to the next `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_up_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    // this incantation maintains provenance of ptr
    // while allowing the compiler to see through the wrapping_add and optimize it
    ptr.wrapping_add(((ptr as usize + align_mask) & !align_mask) - ptr as usize)
}

/// Aligns `ptr` down to `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_down_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    ptr.wrapping_sub(ptr as usize & align_mask)
}

/// Rounds `size` up to a multiple of `align_mask + 1`, saturating at the
/// largest such multiple instead of overflowing.
#[inline]
pub const fn align_size_up(size: usize, align_mask: usize) -> usize {
    match size.checked_add(align_mask) {
        Some(size) => size & !align_mask,
        None => usize::MAX & !align_mask,
    }
}

#[inline]
pub fn is_aligned_to(ptr: *mut u8, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());

    ptr as usize & (align - 1) == 0
}

/// `NonNull::slice_from_raw_parts` without the MSRV bump.
#[inline]
pub fn nonnull_slice_from_raw_parts(ptr: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // SAFETY: `ptr` is non-null, so the slice pointer is too
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) }
}
