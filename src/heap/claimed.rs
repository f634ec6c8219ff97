use core::ptr::NonNull;

use super::{HeapExhausted, HeapProvider};
use crate::{base::ALIGNMENT, ptr_utils};

/// A heap within a fixed region of memory, handed out from the bottom up.
///
/// The region's base is aligned up to [`ALIGNMENT`]. Extension fails
/// once the break would pass the end of the region.
///
/// # Example
///
/// ```
/// # use segfit::{ClaimedHeap, HeapProvider};
/// static mut ARENA: [u8; 4096] = [0; 4096];
///
/// let mut heap = unsafe { ClaimedHeap::array(core::ptr::addr_of_mut!(ARENA)) };
/// assert!(heap.extend(1024).is_ok());
/// assert!(heap.extend(4096).is_err());
/// assert_eq!(heap.size(), 1024);
/// ```
#[derive(Debug)]
pub struct ClaimedHeap {
    base: *mut u8,
    size: usize,
    used: usize,
}

unsafe impl Send for ClaimedHeap {}

impl ClaimedHeap {
    /// Create a new [`ClaimedHeap`] over the `size` bytes at `base`.
    ///
    /// # Safety
    /// The memory must be valid for reads and writes, and not be used
    /// for anything else, for as long as the heap is in use.
    #[inline]
    pub const unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size, used: 0 }
    }

    /// Create a new [`ClaimedHeap`] over `array`.
    ///
    /// # Safety
    /// See [`ClaimedHeap::new`].
    #[inline]
    pub const unsafe fn array<T, const N: usize>(array: *mut [T; N]) -> Self {
        Self::new(array.cast(), N * core::mem::size_of::<T>())
    }

    #[inline]
    fn aligned_base(&self) -> *mut u8 {
        ptr_utils::align_up_by(self.base, ALIGNMENT - 1)
    }

    /// Bytes of the region usable as heap.
    #[inline]
    pub fn capacity(&self) -> usize {
        let padding = self.aligned_base() as usize - self.base as usize;
        self.size.saturating_sub(padding)
    }

    /// Bytes of the region not yet handed out.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used
    }
}

unsafe impl HeapProvider for ClaimedHeap {
    fn extend(&mut self, increment: usize) -> Result<NonNull<u8>, HeapExhausted> {
        if increment > self.remaining() {
            return Err(HeapExhausted);
        }

        let old_acme = NonNull::new(self.acme()).ok_or(HeapExhausted)?;
        self.used += increment;
        Ok(old_acme)
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.aligned_base()
    }

    #[inline]
    fn acme(&self) -> *mut u8 {
        self.aligned_base().wrapping_add(self.used)
    }
}
