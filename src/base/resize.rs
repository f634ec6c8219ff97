//! Resizing allocations, preferring to grow in place.

use core::ptr::NonNull;

use super::block::{self, block_of, block_size, is_allocated, payload_of};
use super::{required_block_size, Segfit, ALIGNMENT, HEADER_SIZE, REALLOC_BUFFER};
use crate::heap::HeapProvider;

impl<H: HeapProvider> Segfit<H> {
    /// Resize the allocation at `ptr` to hold at least `size` bytes.
    ///
    /// - `ptr` of `None` allocates.
    /// - `size` of zero frees `ptr` and returns `None`.
    ///
    /// Otherwise, growth is attempted in this order, and the first that works is used:
    /// 1. The block is already big enough.
    /// 2. Absorb the free block above.
    /// 3. Absorb the free blocks on either side, moving the payload down.
    /// 4. Absorb the free block below, moving the payload down.
    /// 5. The block is at the end of the heap: grow the heap.
    /// 6. Allocate elsewhere, copy, and free the old allocation.
    ///
    /// A free block below is only absorbed if it's larger than [`REALLOC_BUFFER`].
    /// Excess space is never split off.
    ///
    /// If `None` is returned for a nonzero `size`, the original allocation is untouched
    /// and still valid.
    ///
    /// # Safety
    /// `ptr` must be `None` or a live allocation from this allocator.
    pub unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else { return self.allocate(size) };

        if size == 0 {
            self.free(Some(ptr));
            return None;
        }

        let dir = self.directory?;

        let size = if size < REALLOC_BUFFER { size.next_power_of_two() } else { size };
        let need = required_block_size(size)?;

        let block = block_of(ptr.as_ptr());
        let old_size = block_size(block);
        debug_assert!(is_allocated(block), "{:p} is not allocated", ptr);

        if need <= old_size - HEADER_SIZE {
            #[cfg(feature = "counters")]
            self.counters.account_resize_in_place(old_size, old_size);

            return Some(ptr);
        }

        let next = block.add(old_size);
        let next_size =
            if self.is_within_heap(next) && !is_allocated(next) { block_size(next) } else { 0 };

        if next_size != 0 && old_size + next_size >= need {
            self.deregister_free(dir, next);
            block::set_allocated(block, old_size + next_size);

            #[cfg(feature = "counters")]
            self.counters.account_resize_in_place(old_size, old_size + next_size);

            return Some(ptr);
        }

        if let Some(prev) = self.free_predecessor(dir, block) {
            let prev_size = block_size(prev);

            if prev_size > REALLOC_BUFFER {
                let absorbed = if next_size != 0 && prev_size + old_size + next_size >= need {
                    Some(next_size)
                } else if prev_size + old_size >= need {
                    Some(0)
                } else {
                    None
                };

                if let Some(absorbed) = absorbed {
                    self.deregister_free(dir, prev);
                    if absorbed != 0 {
                        self.deregister_free(dir, next);
                    }

                    // the regions overlap whenever the predecessor is smaller than the payload
                    core::ptr::copy(ptr.as_ptr(), payload_of(prev), old_size - HEADER_SIZE);

                    let new_size = prev_size + old_size + absorbed;
                    block::set_allocated(prev, new_size);

                    #[cfg(feature = "counters")]
                    self.counters.account_resize_moved(new_size - old_size);

                    return Some(NonNull::new_unchecked(payload_of(prev)));
                }
            }
        }

        if !self.is_within_heap(next) {
            let increment = need + ALIGNMENT - old_size;
            self.extend_heap(dir, increment)?;
            block::set_allocated(block, old_size + increment);

            #[cfg(feature = "counters")]
            self.counters.account_resize_in_place(old_size, old_size + increment);

            return Some(ptr);
        }

        let new_ptr = self.allocate(size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size - HEADER_SIZE);
        self.free(Some(ptr));

        // the allocation and free already accounted for the bytes
        #[cfg(feature = "counters")]
        self.counters.account_resize_moved(0);

        Some(new_ptr)
    }
}
