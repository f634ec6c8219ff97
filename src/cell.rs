//! [`SegfitCell`] allows using [`Segfit`] as a Rust allocator
//! for single-threaded unsynchronized use.
//!
//! See [`SegfitCell`].

use core::{
    alloc::{GlobalAlloc, Layout},
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
};

use allocator_api2::alloc::{AllocError, Allocator};

use crate::{
    base::{CheckError, CheckOptions, Segfit, ALIGNMENT},
    heap::{HeapExhausted, HeapProvider},
    ptr_utils::nonnull_slice_from_raw_parts,
};

/// [`SegfitCell`] implements [`GlobalAlloc`] and [`Allocator`] without locking,
/// but is [`!Sync`](Sync).
///
/// The inner [`Segfit`] is initialized on the first allocation if
/// [`SegfitCell::init`] wasn't called beforehand.
///
/// Requests for alignment above [`ALIGNMENT`] fail.
///
/// # Example
/// ```rust
/// # extern crate allocator_api2;
/// use allocator_api2::vec::Vec;
/// use segfit::{ClaimedHeap, SegfitCell};
///
/// static mut ARENA: [u64; 1024] = [0; 1024];
///
/// let segfit = SegfitCell::new(unsafe { ClaimedHeap::array(core::ptr::addr_of_mut!(ARENA)) });
///
/// let mut my_vec = Vec::<u32, _>::with_capacity_in(42, &segfit);
/// my_vec.push(123);
/// ```
///
/// # Safety
/// [`SegfitCell`]'s API does not expose references to the inner [`Segfit`] within
/// an [`UnsafeCell`] and is `!Sync`, so it's safe to mutate the inner data
/// through a shared reference.
///
/// The exception is the [`HeapProvider`], which is called while the inner
/// [`Segfit`] is borrowed. Implementations must not use the
/// [`SegfitCell`] directly or indirectly.
///
/// To help catch bad [`HeapProvider`] implementations, [`SegfitCell`] tracks
/// borrows when `debug_assertions` are enabled, similar to a
/// [`RefCell`](core::cell::RefCell).
#[derive(Debug)]
pub struct SegfitCell<H: HeapProvider> {
    cell: UnsafeCell<Segfit<H>>,

    #[cfg(debug_assertions)]
    borrowed_at: core::cell::Cell<Option<&'static core::panic::Location<'static>>>,
}

impl<H: HeapProvider> SegfitCell<H> {
    /// Create a new [`SegfitCell`] over `heap`.
    #[inline]
    pub const fn new(heap: H) -> Self {
        Self {
            cell: UnsafeCell::new(Segfit::new(heap)),

            #[cfg(debug_assertions)]
            borrowed_at: core::cell::Cell::new(None),
        }
    }

    /// Returns a mutable reference to the inner [`Segfit`].
    #[inline]
    pub fn get_mut(&mut self) -> &mut Segfit<H> {
        self.cell.get_mut()
    }

    /// Consumes the [`SegfitCell`], returning the inner [`Segfit`].
    #[inline]
    pub fn into_inner(self) -> Segfit<H> {
        self.cell.into_inner()
    }

    /// Borrow the inner [`Segfit`] mutably.
    ///
    /// # Safety
    /// Creating aliasing references must be avoided.
    /// [`SegfitCell`] ensures against this in the following ways:
    ///
    /// - [`SegfitCell`]'s functions do not call [`SegfitCell::borrow`] more than once.
    /// - [`SegfitCell`]'s functions do not call another [`SegfitCell`] function while holding a [`BorrowedSegfit`].
    /// - [`SegfitCell`]'s API does not expose references to the inner [`Segfit`].
    ///     - [`HeapProvider`] implementations run while the inner [`Segfit`] is borrowed.
    ///         Implementing [`HeapProvider`] is unsafe because the implementor must uphold
    ///         that they do not touch the outer [`SegfitCell`].
    #[inline]
    #[track_caller]
    unsafe fn borrow(&self) -> BorrowedSegfit<'_, H> {
        #[cfg(debug_assertions)]
        {
            if let Some(borrowed_at) = self.borrowed_at.take() {
                panic!(
                    "Tried to borrow the Segfit, was borrowed previously at {}:{}:{}. Did the heap provider attempt to use the SegfitCell?",
                    borrowed_at.file(),
                    borrowed_at.line(),
                    borrowed_at.column(),
                );
            }

            self.borrowed_at.set(Some(core::panic::Location::caller()));
        }

        BorrowedSegfit {
            ptr: unsafe { NonNull::new_unchecked(self.cell.get()) },
            _phantom: PhantomData,

            #[cfg(debug_assertions)]
            borrow_release: &self.borrowed_at,
        }
    }

    /// Initialize the inner [`Segfit`]. See [`Segfit::init`].
    #[inline]
    #[track_caller]
    pub fn init(&self) -> Result<(), HeapExhausted> {
        // SAFETY: See `Self::borrow`'s safety docs
        unsafe { self.borrow().init() }
    }

    /// Check the heap's consistency. See [`Segfit::check`].
    #[inline]
    #[track_caller]
    pub fn check(&self) -> Result<(), CheckError> {
        // SAFETY: See `Self::borrow`'s safety docs
        unsafe { self.borrow().check() }
    }

    /// Check the heap's consistency with a chosen set of checks. See [`Segfit::check_with`].
    #[inline]
    #[track_caller]
    pub fn check_with(&self, options: &CheckOptions) -> Result<(), CheckError> {
        // SAFETY: See `Self::borrow`'s safety docs
        unsafe { self.borrow().check_with(options) }
    }

    /// Obtain a clone of the inner allocation statistics.
    #[cfg(feature = "counters")]
    #[inline]
    #[track_caller]
    pub fn counters(&self) -> crate::base::Counters {
        unsafe {
            // SAFETY: See `Self::borrow`'s safety docs
            self.borrow().counters().clone()
        }
    }
}

struct BorrowedSegfit<'b, H: HeapProvider> {
    ptr: NonNull<Segfit<H>>,
    _phantom: PhantomData<&'b ()>,

    #[cfg(debug_assertions)]
    borrow_release: &'b core::cell::Cell<Option<&'static core::panic::Location<'static>>>,
}

impl<H: HeapProvider> BorrowedSegfit<'_, H> {
    /// Allocate, initializing first if need be.
    #[inline]
    fn allocate_lazily(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > ALIGNMENT {
            return None;
        }

        if !self.is_initialized() {
            self.init().ok()?;
        }

        self.allocate(layout.size())
    }
}

impl<H: HeapProvider> Drop for BorrowedSegfit<'_, H> {
    #[inline]
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.borrow_release.set(None);
        }
    }
}

impl<H: HeapProvider> Deref for BorrowedSegfit<'_, H> {
    type Target = Segfit<H>;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<H: HeapProvider> DerefMut for BorrowedSegfit<'_, H> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

unsafe impl<H: HeapProvider> GlobalAlloc for SegfitCell<H> {
    #[inline]
    #[track_caller]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: See `Self::borrow`'s safety docs
        self.borrow().allocate_lazily(layout).map_or(null_mut(), |nn| nn.as_ptr())
    }

    #[inline]
    #[track_caller]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: See `Self::borrow`'s safety docs
        // SAFETY: guaranteed by caller
        self.borrow().free(NonNull::new(ptr))
    }

    #[inline]
    #[track_caller]
    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: See `Self::borrow`'s safety docs
        // SAFETY: guaranteed by caller that `ptr` was allocated here with an acceptable alignment
        self.borrow().resize(NonNull::new(ptr), new_size).map_or(null_mut(), |nn| nn.as_ptr())
    }
}

unsafe impl<H: HeapProvider> Allocator for SegfitCell<H> {
    #[inline]
    #[track_caller]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(nonnull_slice_from_raw_parts(dangling, layout.size()));
        }

        // SAFETY: See `Self::borrow`'s safety docs
        match unsafe { self.borrow().allocate_lazily(layout) } {
            Some(allocation) => Ok(nonnull_slice_from_raw_parts(allocation, layout.size())),
            None => Err(AllocError),
        }
    }

    #[inline]
    #[track_caller]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            // SAFETY: See `Self::borrow`'s safety docs
            self.borrow().free(Some(ptr))
        }
    }

    #[inline]
    #[track_caller]
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.allocate(layout)?;
        // SAFETY: `alloc` returns a valid memory block
        unsafe { ptr.cast::<u8>().as_ptr().write_bytes(0, ptr.len()) }
        Ok(ptr)
    }

    #[track_caller]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return Allocator::allocate(self, new_layout);
        }

        if new_layout.align() > ALIGNMENT {
            return Err(AllocError);
        }

        // SAFETY: See `Self::borrow`'s safety docs
        // SAFETY: guaranteed by caller that `ptr` is a live allocation
        let allocation = self.borrow().resize(Some(ptr), new_layout.size()).ok_or(AllocError)?;

        Ok(nonnull_slice_from_raw_parts(allocation, new_layout.size()))
    }

    #[inline]
    #[track_caller]
    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let res = self.grow(ptr, old_layout, new_layout);

        if let Ok(allocation) = res {
            allocation
                .as_ptr()
                .cast::<u8>()
                .add(old_layout.size())
                .write_bytes(0, new_layout.size() - old_layout.size());
        }

        res
    }

    #[track_caller]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() > 0 {
                // SAFETY: See `Self::borrow`'s safety docs
                self.borrow().free(Some(ptr));
            }

            let dangling = unsafe { NonNull::new_unchecked(new_layout.align() as *mut u8) };
            return Ok(nonnull_slice_from_raw_parts(dangling, new_layout.size()));
        }

        if new_layout.align() > ALIGNMENT {
            return Err(AllocError);
        }

        // blocks are never split on shrinking, so the allocation stays put
        Ok(nonnull_slice_from_raw_parts(ptr, new_layout.size()))
    }
}

/// Wraps a [`SegfitCell`] and implements [`Sync`], allowing it
/// to be used as a `#[global_allocator]` in single-threaded programs.
///
/// # Example
/// ```rust
/// use segfit::{cell::SegfitCellAssumeSingleThreaded, ClaimedHeap, SegfitCell};
///
/// static mut ARENA: [u64; 4096] = [0; 4096];
///
/// // #[global_allocator]
/// static ALLOCATOR: SegfitCellAssumeSingleThreaded<ClaimedHeap> = unsafe {
///     SegfitCellAssumeSingleThreaded::new(SegfitCell::new(ClaimedHeap::array(
///         core::ptr::addr_of_mut!(ARENA),
///     )))
/// };
/// ```
#[derive(Debug)]
pub struct SegfitCellAssumeSingleThreaded<H: HeapProvider>(SegfitCell<H>);

unsafe impl<H: HeapProvider> Sync for SegfitCellAssumeSingleThreaded<H> {}

impl<H: HeapProvider> SegfitCellAssumeSingleThreaded<H> {
    /// Wrap `segfit`.
    ///
    /// # Safety
    /// The program must never use the allocator from more than one thread.
    pub const unsafe fn new(segfit: SegfitCell<H>) -> Self {
        Self(segfit)
    }

    /// The wrapped [`SegfitCell`].
    pub fn inner(&self) -> &SegfitCell<H> {
        &self.0
    }
}

unsafe impl<H: HeapProvider> GlobalAlloc for SegfitCellAssumeSingleThreaded<H> {
    #[track_caller]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0.alloc(layout)
    }
    #[track_caller]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.0.dealloc(ptr, layout)
    }
    #[track_caller]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.0.realloc(ptr, layout, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClaimedHeap;

    fn cell_over(memory: &mut [u64]) -> SegfitCell<ClaimedHeap> {
        let heap = unsafe { ClaimedHeap::new(memory.as_mut_ptr().cast(), memory.len() * 8) };
        SegfitCell::new(heap)
    }

    #[test]
    fn initializes_on_first_allocation() {
        let mut memory = vec![0u64; 2048];
        let segfit = cell_over(&mut memory);

        let layout = Layout::from_size_align(24, 8).unwrap();
        let ptr = unsafe { segfit.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % ALIGNMENT, 0);
        assert_eq!(segfit.check(), Ok(()));

        unsafe { segfit.dealloc(ptr, layout) };
        assert_eq!(segfit.check(), Ok(()));
        assert!(segfit.into_inner().is_initialized());
    }

    #[test]
    fn overaligned_requests_fail() {
        let mut memory = vec![0u64; 2048];
        let segfit = cell_over(&mut memory);

        let layout = Layout::from_size_align(64, 64).unwrap();
        assert!(unsafe { segfit.alloc(layout) }.is_null());
        assert!(Allocator::allocate(&segfit, layout).is_err());
    }

    #[test]
    fn realloc_keeps_contents() {
        let mut memory = vec![0u64; 4096];
        let segfit = cell_over(&mut memory);
        segfit.init().unwrap();

        let layout = Layout::from_size_align(100, 8).unwrap();
        unsafe {
            let ptr = segfit.alloc(layout);
            for i in 0..100 {
                ptr.add(i).write(i as u8);
            }

            let ptr = segfit.realloc(ptr, layout, 10_000);
            assert!(!ptr.is_null());
            for i in 0..100 {
                assert_eq!(ptr.add(i).read(), i as u8);
            }
            assert_eq!(segfit.check(), Ok(()));

            segfit.dealloc(ptr, Layout::from_size_align(10_000, 8).unwrap());
        }
        assert_eq!(segfit.check(), Ok(()));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut memory = vec![0u64; 1024];
        let segfit = cell_over(&mut memory);

        let layout = Layout::from_size_align(1 << 16, 8).unwrap();
        assert!(unsafe { segfit.alloc(layout) }.is_null());
        assert!(Allocator::allocate(&segfit, layout).is_err());
        assert_eq!(segfit.check(), Ok(()));
    }

    #[test]
    fn allocator_api_vec() {
        let mut memory = vec![0u64; 8192];
        let segfit = cell_over(&mut memory);

        let mut vec = allocator_api2::vec::Vec::<u32, _>::new_in(&segfit);
        for i in 0..2000 {
            vec.push(i);
        }
        assert!(vec.iter().copied().eq(0..2000));
        assert_eq!(segfit.check(), Ok(()));

        vec.truncate(10);
        vec.shrink_to_fit();
        assert!(vec.iter().copied().eq(0..10));

        vec.clear();
        vec.shrink_to_fit();
        drop(vec);

        let mut segfit = segfit;
        assert_eq!(segfit.get_mut().blocks().filter(|b| b.is_allocated).count(), 0);
        assert_eq!(segfit.check(), Ok(()));
    }

    #[test]
    fn zero_sized_allocations_are_dangling() {
        let mut memory = vec![0u64; 1024];
        let segfit = cell_over(&mut memory);

        let layout = Layout::from_size_align(0, 4).unwrap();
        let ptr = Allocator::allocate(&segfit, layout).unwrap();
        assert_eq!(ptr.cast::<u8>().as_ptr() as usize, 4);
        unsafe { Allocator::deallocate(&segfit, ptr.cast(), layout) };

        assert!(!segfit.into_inner().is_initialized());
    }

    #[test]
    fn single_threaded_wrapper_forwards() {
        let mut memory = vec![0u64; 2048];
        let segfit = unsafe { SegfitCellAssumeSingleThreaded::new(cell_over(&mut memory)) };

        let layout = Layout::from_size_align(40, 8).unwrap();
        unsafe {
            let ptr = segfit.alloc(layout);
            assert!(!ptr.is_null());
            let ptr = segfit.realloc(ptr, layout, 400);
            assert!(!ptr.is_null());
            segfit.dealloc(ptr, Layout::from_size_align(400, 8).unwrap());
        }
        assert_eq!(segfit.inner().check(), Ok(()));
    }
}
