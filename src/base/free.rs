//! Freeing, and recovering a block's free predecessor.

use core::ptr::NonNull;

use super::block::{self, block_of, block_size, is_allocated};
use super::directory::Directory;
use super::{Segfit, ALIGNMENT, HEADER_SIZE, MIN_BLOCK_SIZE};
use crate::heap::HeapProvider;

impl<H: HeapProvider> Segfit<H> {
    /// Free the allocation at `ptr`, merging it with any free neighbors.
    ///
    /// `None` is ignored.
    ///
    /// # Safety
    /// `ptr` must be `None` or a live allocation from this allocator.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };
        let Some(dir) = self.directory else {
            debug_assert!(false, "{:p} freed before initialization", ptr);
            return;
        };

        let mut block = block_of(ptr.as_ptr());
        let mut size = block_size(block);

        debug_assert!(is_allocated(block), "{:p} is not allocated", ptr);
        debug_assert!(block >= dir.end() && self.is_within_heap(block));

        #[cfg(feature = "counters")]
        self.counters.account_dealloc(size);

        let next = block.add(size);

        if let Some(prev) = self.free_predecessor(dir, block) {
            size += block_size(prev);
            self.deregister_free(dir, prev);
            block = prev;
        }

        if self.is_within_heap(next) && !is_allocated(next) {
            size += block_size(next);
            self.deregister_free(dir, next);
        }

        self.register_free(dir, block, size);
    }

    /// Returns the block immediately below `block` if it is free.
    ///
    /// Allocated blocks have no footer, so the word below `block` may be client data
    /// that happens to look like one. The candidate it points to must pass every
    /// layout check and then be found in its bucket before it's believed.
    pub(super) unsafe fn free_predecessor(&self, dir: Directory, block: *mut u8) -> Option<*mut u8> {
        let first = dir.end();
        if block <= first {
            return None;
        }

        let footer = block::footer_below(block);
        if !footer.is_free() {
            return None;
        }

        let size = footer.size();

        // the candidate must start at or above the first block, checked without wrapping
        if size > block as usize - first as usize {
            return None;
        }

        let candidate = block.wrapping_sub(size);

        if (candidate as usize + HEADER_SIZE) % ALIGNMENT != 0 {
            return None;
        }
        if size < MIN_BLOCK_SIZE {
            return None;
        }

        let header = block::header(candidate);

        if header.size() != size || !header.is_free() {
            return None;
        }

        dir.contains(candidate, size).then_some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fill, segfit_with_capacity, verify};

    #[test]
    fn free_none_is_a_no_op() {
        let mut segfit = segfit_with_capacity(1 << 16);
        unsafe { segfit.free(None) };

        segfit.init().unwrap();
        let before: Vec<_> = segfit.blocks().collect();
        unsafe { segfit.free(None) };
        assert_eq!(segfit.blocks().collect::<Vec<_>>(), before);
    }

    #[test]
    fn coalesces_with_both_neighbors() {
        let mut segfit = segfit_with_capacity(1 << 16);
        segfit.init().unwrap();

        let a = segfit.allocate(100).unwrap();
        let b = segfit.allocate(200).unwrap();
        let c = segfit.allocate(300).unwrap();
        let d = segfit.allocate(400).unwrap();

        unsafe {
            // predecessor free, successor allocated
            segfit.free(Some(a));
            segfit.free(Some(b));
            assert_eq!(segfit.check(), Ok(()));

            let first = segfit.blocks().next().unwrap();
            assert_eq!(first.addr, block_of(a.as_ptr()));
            assert_eq!(first.size, 136 + 264);
            assert!(!first.is_allocated);

            // successor free only
            segfit.free(Some(d));
            assert_eq!(segfit.check(), Ok(()));
            assert_eq!(segfit.blocks().filter(|b| !b.is_allocated).count(), 2);

            // both
            segfit.free(Some(c));
            assert_eq!(segfit.check(), Ok(()));
        }

        let blocks: Vec<_> = segfit.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 4104);
        assert!(!blocks[0].is_allocated);
    }

    #[test]
    fn freeing_everything_leaves_one_block() {
        let mut segfit = segfit_with_capacity(1 << 18);
        segfit.init().unwrap();

        let ptrs: Vec<_> = (1..40).map(|i| segfit.allocate(i * 97).unwrap()).collect();
        let heap_size = segfit.heap().size();

        // odd ones first, then the evens
        for ptr in ptrs.iter().skip(1).step_by(2).chain(ptrs.iter().step_by(2)) {
            unsafe { segfit.free(Some(*ptr)) };
            assert_eq!(segfit.check(), Ok(()));
        }

        let blocks: Vec<_> = segfit.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, heap_size - crate::base::DIRECTORY_SIZE);
        assert!(!blocks[0].is_allocated);
    }

    #[test]
    fn payload_posing_as_a_footer_is_not_merged() {
        let mut segfit = segfit_with_capacity(1 << 16);
        segfit.init().unwrap();

        let a = segfit.allocate(100).unwrap();
        let b = segfit.allocate(100).unwrap();
        let a_block = block_of(a.as_ptr());
        let b_block = block_of(b.as_ptr());
        assert_eq!(b_block, a_block.wrapping_add(136));

        unsafe {
            fill(a, 132, 7);

            // a fake 32 byte free block at the top of a's payload, passing every layout check
            let fake = b_block.sub(32);
            fake.cast::<u32>().write(32);
            b_block.sub(HEADER_SIZE).cast::<u32>().write(32);
            assert_eq!(segfit.free_predecessor(segfit.directory.unwrap(), b_block), None);

            segfit.free(Some(b));
            assert_eq!(segfit.check(), Ok(()));

            // a is untouched
            verify(a, 100, 7);
            assert_eq!(fake.cast::<u32>().read(), 32);
            assert_eq!(b_block.sub(HEADER_SIZE).cast::<u32>().read(), 32);
        }

        let blocks: Vec<_> = segfit.blocks().map(|b| (b.addr, b.is_allocated)).collect();
        assert_eq!(blocks, [(a_block, true), (b_block, false)]);
    }

    #[test]
    fn footer_reaching_below_the_heap_is_rejected() {
        let mut segfit = segfit_with_capacity(1 << 16);
        segfit.init().unwrap();

        let a = segfit.allocate(100).unwrap();
        let b = segfit.allocate(100).unwrap();
        let dir = segfit.directory.unwrap();
        let b_block = block_of(b.as_ptr());
        let footer = b_block.wrapping_sub(HEADER_SIZE).cast::<u32>();

        unsafe {
            fill(a, 132, 11);

            // one block size past the first block, then the largest size a footer can hold
            let just_below = (b_block as usize - dir.end() as usize + ALIGNMENT) as u32;
            for size in [just_below, 0xF000_0000, 0xFFFF_FFF8] {
                footer.write(size);
                assert_eq!(segfit.free_predecessor(dir, b_block), None);
            }

            // sizes above the block's own address would wrap around
            let wrapping = ((b_block as usize + ALIGNMENT) & !(ALIGNMENT - 1)) as u32;
            if (wrapping as usize) > b_block as usize {
                footer.write(wrapping);
                assert_eq!(segfit.free_predecessor(dir, b_block), None);
            }

            segfit.free(Some(b));
            verify(a, 100, 11);
        }

        assert_eq!(segfit.check(), Ok(()));
        assert_eq!(segfit.blocks().filter(|b| b.is_allocated).count(), 1);
    }

    #[test]
    fn payload_with_flag_bits_is_not_a_footer() {
        let mut segfit = segfit_with_capacity(1 << 16);
        segfit.init().unwrap();

        let a = segfit.allocate(16).unwrap();
        let b = segfit.allocate(16).unwrap();

        unsafe {
            // 24 | 2 would point straight at a's header
            block_of(b.as_ptr()).sub(HEADER_SIZE).cast::<u32>().write(24 | 2);
            assert_eq!(segfit.free_predecessor(segfit.directory.unwrap(), block_of(b.as_ptr())), None);

            segfit.free(Some(a));
            segfit.free(Some(b));
        }

        assert_eq!(segfit.check(), Ok(()));
        assert_eq!(segfit.blocks().count(), 1);
    }

    #[test]
    fn first_block_has_no_predecessor() {
        let mut segfit = segfit_with_capacity(1 << 16);
        segfit.init().unwrap();

        let a = segfit.allocate(64).unwrap();
        let dir = segfit.directory.unwrap();
        assert_eq!(block_of(a.as_ptr()), dir.end());

        unsafe {
            assert_eq!(segfit.free_predecessor(dir, dir.end()), None);
            segfit.free(Some(a));
        }
        assert_eq!(segfit.check(), Ok(()));
    }
}
