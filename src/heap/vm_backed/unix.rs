use core::ptr::NonNull;

use super::{ReserveCommitRelease, COMMIT_GRANULARITY};
use crate::ptr_utils;

/// Reserves with `mmap(PROT_NONE)` and commits with `mprotect`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixMMapSource;

unsafe impl ReserveCommitRelease for UnixMMapSource {
    #[inline]
    fn reserve(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        let size = ptr_utils::align_size_up(min_size.max(1), COMMIT_GRANULARITY - 1);

        // SAFETY: a fresh anonymous mapping aliases nothing
        let memory = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if memory == libc::MAP_FAILED {
            return None;
        }

        let memory = NonNull::new(memory.cast::<u8>())?;
        Some(ptr_utils::nonnull_slice_from_raw_parts(memory, size))
    }

    #[inline]
    unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        libc::mprotect(base.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE) == 0
    }

    #[inline]
    unsafe fn release(&mut self, base: NonNull<u8>, size: usize) {
        let result = libc::munmap(base.as_ptr().cast(), size);

        // panicking may allocate, which would re-enter a global allocator
        #[cfg(debug_assertions)]
        if result != 0 {
            libc::abort();
        }
        let _ = result;
    }
}
