use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::{ClaimedHeap, Segfit};

/// A [`Segfit`] over a heap-allocated region, freed on drop.
pub(crate) struct TestSegfit {
    segfit: Segfit<ClaimedHeap>,
    _memory: Box<[u64]>,
}

impl Deref for TestSegfit {
    type Target = Segfit<ClaimedHeap>;

    fn deref(&self) -> &Self::Target {
        &self.segfit
    }
}

impl DerefMut for TestSegfit {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.segfit
    }
}

/// An uninitialized [`Segfit`] whose heap can grow to `bytes`, rounded up to 8.
pub(crate) fn segfit_with_capacity(bytes: usize) -> TestSegfit {
    let mut memory = vec![0u64; (bytes + 7) / 8].into_boxed_slice();
    let heap = unsafe { ClaimedHeap::new(memory.as_mut_ptr().cast(), memory.len() * 8) };
    TestSegfit { segfit: Segfit::new(heap), _memory: memory }
}

/// Write a pattern derived from `seed` over `len` bytes at `ptr`.
pub(crate) unsafe fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8));
    }
}

/// Check that the pattern written by [`fill`] is intact.
pub(crate) unsafe fn verify(ptr: NonNull<u8>, len: usize, seed: u8) {
    for i in 0..len {
        assert_eq!(
            ptr.as_ptr().add(i).read(),
            seed.wrapping_add(i as u8),
            "byte {} of the allocation at {:p} was clobbered",
            i,
            ptr
        );
    }
}
