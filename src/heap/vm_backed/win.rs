use windows_sys::Win32::System::Memory::*;

use core::ptr::{null_mut, NonNull};

use super::{ReserveCommitRelease, COMMIT_GRANULARITY};
use crate::ptr_utils;

/// Reserves with `VirtualAlloc(MEM_RESERVE)` and commits with `VirtualAlloc(MEM_COMMIT)`.
///
/// The Windows allocation granularity, `dwAllocationGranularity`,
/// has been 64KiB since Windows NT, which matches [`COMMIT_GRANULARITY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Win32VirtualAllocSource;

unsafe impl ReserveCommitRelease for Win32VirtualAllocSource {
    #[inline]
    fn reserve(&mut self, min_size: usize) -> Option<NonNull<[u8]>> {
        let size = ptr_utils::align_size_up(min_size.max(1), COMMIT_GRANULARITY - 1);

        // SAFETY: reserving fresh address space aliases nothing
        let memory = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };

        let memory = NonNull::new(memory.cast::<u8>())?;
        Some(ptr_utils::nonnull_slice_from_raw_parts(memory, size))
    }

    #[inline]
    unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        let result = VirtualAlloc(base.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE);

        result == base.as_ptr().cast()
    }

    #[inline]
    unsafe fn release(&mut self, base: NonNull<u8>, _size: usize) {
        let successful = VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE);

        debug_assert!(successful != 0);
    }
}
