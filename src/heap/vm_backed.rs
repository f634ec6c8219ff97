//! A heap in address space reserved from the operating system, committed as the heap grows.

use core::{fmt::Debug, ptr::NonNull};

use super::{HeapExhausted, HeapProvider};
use crate::ptr_utils;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::UnixMMapSource;

#[cfg(windows)]
mod win;
#[cfg(windows)]
pub use win::Win32VirtualAllocSource;

/// A [`VmHeap`] over the platform's virtual memory primitives.
#[cfg(unix)]
pub type SysHeap = VmHeap<UnixMMapSource>;
/// A [`VmHeap`] over the platform's virtual memory primitives.
#[cfg(windows)]
pub type SysHeap = VmHeap<Win32VirtualAllocSource>;

/// Memory is committed in multiples of this many bytes.
pub const COMMIT_GRANULARITY: usize = 64 << 10;

/// Reservations must be aligned to at least this. No supported platform has smaller pages.
pub const MIN_RESERVATION_ALIGN: usize = 4 << 10;

/// A source of reserved address space that can be made usable piece by piece.
///
/// # Safety
/// Implementors must return reservations aligned to the system page size,
/// which is at least [`MIN_RESERVATION_ALIGN`], and sized to a multiple of [`COMMIT_GRANULARITY`]. Committed memory must stay valid until released.
/// Implementations must not allocate through the [`Segfit`](crate::Segfit) the heap belongs to.
pub unsafe trait ReserveCommitRelease: Debug {
    /// Reserve at least `min_size` bytes of address space, without making it usable.
    fn reserve(&mut self, min_size: usize) -> Option<NonNull<[u8]>>;

    /// Make `size` bytes at `base` readable and writable. Returns whether this succeeded.
    ///
    /// # Safety
    /// The range must lie within a reservation, and `base` must lie a multiple of
    /// [`COMMIT_GRANULARITY`] past the reservation's start.
    unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool;

    /// Give back a reservation.
    ///
    /// # Safety
    /// `base` and `size` must describe a whole reservation returned by
    /// [`reserve`](ReserveCommitRelease::reserve), which is no longer in use.
    unsafe fn release(&mut self, base: NonNull<u8>, size: usize);
}

/// A [`HeapProvider`] that reserves `max_size` bytes of address space on first use
/// and commits memory as the heap grows into it.
///
/// The reservation is released on drop.
///
/// # Example
///
/// ```
/// # use segfit::{Segfit, SysHeap};
/// let mut segfit = Segfit::new(SysHeap::with_max_size(16 << 20));
/// segfit.init().unwrap();
///
/// let ptr = segfit.allocate(1 << 20).unwrap();
/// unsafe { segfit.free(Some(ptr)) };
/// ```
#[derive(Debug)]
pub struct VmHeap<S: ReserveCommitRelease> {
    source: S,
    max_size: usize,
    reservation: Option<NonNull<[u8]>>,
    committed: usize,
    used: usize,
}

unsafe impl<S: ReserveCommitRelease + Send> Send for VmHeap<S> {}

impl<S: ReserveCommitRelease> VmHeap<S> {
    /// The reservation size used by [`SysHeap::default`].
    pub const DEFAULT_MAX_SIZE: usize = 256 << 20;

    /// Create a [`VmHeap`] that can grow to `max_size` bytes.
    ///
    /// Nothing is reserved until the heap is first extended.
    pub const fn new(source: S, max_size: usize) -> Self {
        Self { source, max_size, reservation: None, committed: 0, used: 0 }
    }

    /// Bytes committed so far. Always at least [`size`](HeapProvider::size).
    pub fn committed(&self) -> usize {
        self.committed
    }

    fn reservation(&mut self) -> Result<NonNull<[u8]>, HeapExhausted> {
        if let Some(reservation) = self.reservation {
            return Ok(reservation);
        }

        let reservation = self.source.reserve(self.max_size).ok_or(HeapExhausted)?;
        debug_assert!(ptr_utils::is_aligned_to(reservation.cast().as_ptr(), MIN_RESERVATION_ALIGN));

        log::trace!(
            target: "segfit",
            "reserved {} bytes of address space at {:p}",
            reservation.len(),
            reservation.cast::<u8>()
        );

        self.reservation = Some(reservation);
        Ok(reservation)
    }
}

#[cfg(unix)]
impl SysHeap {
    /// Create a [`SysHeap`] that can grow to `max_size` bytes.
    pub const fn with_max_size(max_size: usize) -> Self {
        Self::new(UnixMMapSource, max_size)
    }
}

#[cfg(windows)]
impl SysHeap {
    /// Create a [`SysHeap`] that can grow to `max_size` bytes.
    pub const fn with_max_size(max_size: usize) -> Self {
        Self::new(Win32VirtualAllocSource, max_size)
    }
}

impl Default for SysHeap {
    fn default() -> Self {
        Self::with_max_size(Self::DEFAULT_MAX_SIZE)
    }
}

unsafe impl<S: ReserveCommitRelease> HeapProvider for VmHeap<S> {
    fn extend(&mut self, increment: usize) -> Result<NonNull<u8>, HeapExhausted> {
        let reservation = self.reservation()?;
        let reserved = reservation.len();
        let base = reservation.cast::<u8>().as_ptr();

        if increment > reserved - self.used {
            return Err(HeapExhausted);
        }

        let new_used = self.used + increment;

        if new_used > self.committed {
            let target = ptr_utils::align_size_up(new_used, COMMIT_GRANULARITY - 1).min(reserved);

            // SAFETY: committed is a multiple of the granularity past the page-aligned base,
            // and target lies within the reservation
            let committed = unsafe {
                self.source.commit(NonNull::new_unchecked(base.add(self.committed)), target - self.committed)
            };

            if !committed {
                log::trace!(target: "segfit", "failed to commit {} bytes", target - self.committed);
                return Err(HeapExhausted);
            }

            self.committed = target;
        }

        let old_acme = base.wrapping_add(self.used);
        self.used = new_used;

        // SAFETY: derived from the non-null reservation
        Ok(unsafe { NonNull::new_unchecked(old_acme) })
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.reservation.map_or(core::ptr::null_mut(), |r| r.cast().as_ptr())
    }

    #[inline]
    fn acme(&self) -> *mut u8 {
        self.base().wrapping_add(self.used)
    }
}

impl<S: ReserveCommitRelease> Drop for VmHeap<S> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            // SAFETY: the reservation came from the source and the heap is going away
            unsafe { self.source.release(reservation.cast(), reservation.len()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Segfit;

    #[test]
    fn commits_as_it_grows() {
        let mut heap = SysHeap::with_max_size(1 << 20);
        assert!(heap.base().is_null());
        assert_eq!(heap.size(), 0);

        let a = heap.extend(260).unwrap();
        assert_eq!(heap.base(), a.as_ptr());
        assert_eq!(heap.committed(), COMMIT_GRANULARITY);

        let b = heap.extend(COMMIT_GRANULARITY).unwrap();
        assert_eq!(b.as_ptr(), a.as_ptr().wrapping_add(260));
        assert_eq!(heap.committed(), COMMIT_GRANULARITY * 2);

        unsafe {
            a.as_ptr().write_bytes(0xAB, heap.size());
            assert_eq!(heap.hi().read(), 0xAB);
        }

        assert_eq!(heap.extend(1 << 20), Err(HeapExhausted));
        assert_eq!(heap.size(), 260 + COMMIT_GRANULARITY);

        let rest = (1 << 20) - heap.size();
        assert!(heap.extend(rest).is_ok());
        assert_eq!(heap.committed(), 1 << 20);
        assert_eq!(heap.extend(1), Err(HeapExhausted));
    }

    /// Hands out reservations that are page-aligned but never granule-aligned.
    #[cfg(unix)]
    #[derive(Debug, Default)]
    struct PageOffsetSource {
        inner: UnixMMapSource,
        mapping: Option<NonNull<[u8]>>,
    }

    #[cfg(unix)]
    unsafe impl ReserveCommitRelease for PageOffsetSource {
        fn reserve(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
            let mapping = self.inner.reserve(min_size + COMMIT_GRANULARITY)?;
            self.mapping = Some(mapping);

            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            let base = mapping.cast::<u8>().as_ptr();
            let to_granule = (COMMIT_GRANULARITY - base as usize % COMMIT_GRANULARITY) % COMMIT_GRANULARITY;
            let skip = to_granule + page_size;
            let size = ptr_utils::align_size_up(min_size.max(1), COMMIT_GRANULARITY - 1);
            debug_assert!(skip + size <= mapping.len());

            let base = NonNull::new(base.wrapping_add(skip))?;
            Some(ptr_utils::nonnull_slice_from_raw_parts(base, size))
        }

        unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool {
            self.inner.commit(base, size)
        }

        unsafe fn release(&mut self, _base: NonNull<u8>, _size: usize) {
            if let Some(mapping) = self.mapping.take() {
                self.inner.release(mapping.cast(), mapping.len());
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn page_aligned_reservations_are_accepted() {
        let mut heap = VmHeap::new(PageOffsetSource::default(), 1 << 20);

        let base = heap.extend(260).unwrap().as_ptr();
        assert!(ptr_utils::is_aligned_to(base, MIN_RESERVATION_ALIGN));
        assert!(!ptr_utils::is_aligned_to(base, COMMIT_GRANULARITY));

        assert!(heap.extend(3 * COMMIT_GRANULARITY).is_ok());
        assert_eq!(heap.committed(), 4 * COMMIT_GRANULARITY);
        unsafe { base.write_bytes(0xCD, heap.size()) };

        let mut segfit = Segfit::new(VmHeap::new(PageOffsetSource::default(), 1 << 20));
        segfit.init().unwrap();
        let ptr = segfit.allocate(100_000).unwrap();
        unsafe {
            ptr.as_ptr().write_bytes(0xEF, 100_000);
            segfit.free(Some(ptr));
        }
        assert_eq!(segfit.check(), Ok(()));
    }

    #[test]
    fn backs_an_allocator() {
        let mut segfit = Segfit::new(SysHeap::with_max_size(8 << 20));
        segfit.init().unwrap();

        let ptrs: Vec<_> = (0..64).map(|i| segfit.allocate(1000 * i + 1).unwrap()).collect();
        assert_eq!(segfit.check(), Ok(()));

        for ptr in ptrs {
            unsafe { segfit.free(Some(ptr)) };
        }
        assert_eq!(segfit.check(), Ok(()));
        assert_eq!(segfit.blocks().count(), 1);

        assert!(segfit.allocate(8 << 20).is_none());
        assert_eq!(segfit.check(), Ok(()));
    }
}
