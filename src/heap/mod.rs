//! Heap providers: where [`Segfit`](crate::Segfit) gets its memory.

use core::{fmt::Debug, ptr::NonNull};

mod claimed;
pub use claimed::ClaimedHeap;

#[cfg(all(feature = "system-backed", any(unix, windows)))]
mod vm_backed;
#[cfg(all(feature = "system-backed", any(unix, windows)))]
pub use vm_backed::{ReserveCommitRelease, SysHeap, VmHeap, COMMIT_GRANULARITY, MIN_RESERVATION_ALIGN};
#[cfg(all(feature = "system-backed", unix))]
pub use vm_backed::UnixMMapSource;
#[cfg(all(feature = "system-backed", windows))]
pub use vm_backed::Win32VirtualAllocSource;

/// The heap could not be extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("heap provider exhausted")]
pub struct HeapExhausted;

/// A single contiguous region of memory that grows upward on request.
///
/// # Safety
/// Implementors must guarantee that:
/// - the region `base()..acme()` is readable, writable, and used by nothing
///     but the [`Segfit`](crate::Segfit) that owns the provider,
/// - the region is never moved and never shrinks,
/// - a successful [`extend`](HeapProvider::extend) returns the old `acme()`
///     and makes the next `increment` bytes part of the region,
/// - a failed [`extend`](HeapProvider::extend) changes nothing,
/// - `acme()` is aligned to [`ALIGNMENT`](crate::base::ALIGNMENT) when
///     [`Segfit::init`](crate::Segfit::init) is called.
///
/// Do not allocate from the owning [`Segfit`](crate::Segfit) in any of these methods.
/// When it's wrapped in a [`SegfitCell`](crate::SegfitCell), doing so
/// panics if debug assertions are enabled, and is undefined behavior otherwise.
pub unsafe trait HeapProvider: Debug {
    /// Grow the region by `increment` bytes, returning the start of the new bytes.
    fn extend(&mut self, increment: usize) -> Result<NonNull<u8>, HeapExhausted>;

    /// The lowest address of the region.
    fn base(&self) -> *mut u8;

    /// One past the highest address of the region.
    fn acme(&self) -> *mut u8;

    /// The highest valid address of the region.
    #[inline]
    fn hi(&self) -> *mut u8 {
        self.acme().wrapping_sub(1)
    }

    /// The number of bytes in the region.
    #[inline]
    fn size(&self) -> usize {
        self.acme() as usize - self.base() as usize
    }
}
