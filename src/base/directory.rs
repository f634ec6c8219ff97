//! The segregated free-list directory.
//!
//! The directory occupies the first [`DIRECTORY_SIZE`] bytes of the heap and
//! holds one sentinel per bucket. A sentinel only ever uses its "next" link
//! slot, which sits at the same offset as a free block's, so the list code
//! treats sentinels and member blocks uniformly.
//!
//! Buckets are kept sorted by ascending block size.

use super::block::{self, block_size, is_tail, next_link, prev_link};
use super::{HEADER_SIZE, LIST_TOTAL};

/// Stride between consecutive sentinels.
const SENTINEL_STRIDE: usize = HEADER_SIZE * 2;

/// Bytes reserved at the base of the heap for the bucket sentinels.
///
/// Chosen such that `base + DIRECTORY_SIZE` is `4 (mod 8)` so that
/// the first block's payload is 8-aligned.
pub const DIRECTORY_SIZE: usize = ((SENTINEL_STRIDE * LIST_TOTAL + HEADER_SIZE + 7) & !7) - HEADER_SIZE;

/// The bucket index for blocks of `size` bytes.
///
/// Classes double from 16 bytes: class `k` holds sizes in `[16 * 2^k, 16 * 2^(k+1))`,
/// except that class 0 also takes everything below 32, and the last class is unbounded.
#[inline]
pub const fn size_class(size: usize) -> usize {
    let order = size >> 4;

    if order <= 1 {
        0
    } else {
        let class = order.ilog2() as usize;
        if class < LIST_TOTAL {
            class
        } else {
            LIST_TOTAL - 1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directory {
    base: *mut u8,
}

impl Directory {
    /// Zeroes the sentinels at `base`, which leaves every bucket empty.
    ///
    /// # Safety
    /// `base` must be valid for writes of [`DIRECTORY_SIZE`] bytes and 4-byte aligned.
    pub unsafe fn establish(base: *mut u8) -> Self {
        base.write_bytes(0, DIRECTORY_SIZE);
        Self { base }
    }

    #[inline]
    pub fn base(self) -> *mut u8 {
        self.base
    }

    /// The address of the first block, just past the sentinels.
    #[inline]
    pub fn end(self) -> *mut u8 {
        self.base.wrapping_add(DIRECTORY_SIZE)
    }

    #[inline]
    pub fn sentinel(self, class: usize) -> *mut u8 {
        debug_assert!(class < LIST_TOTAL);
        self.base.wrapping_add(class * SENTINEL_STRIDE)
    }

    #[inline]
    pub fn bucket_for(self, size: usize) -> *mut u8 {
        self.sentinel(size_class(size))
    }

    /// Iterates over the members of the bucket at `sentinel`, smallest first.
    #[inline]
    pub unsafe fn members(self, sentinel: *mut u8) -> Members {
        Members::new(sentinel)
    }

    /// Links a free block into its bucket ahead of the first member
    /// that is at least as large, or at the end if there is none.
    ///
    /// # Safety
    /// `block` must be a free block with a valid header that is not in any bucket.
    pub unsafe fn insert(self, block: *mut u8) {
        let size = block_size(block);
        let mut prev = self.bucket_for(size);

        loop {
            if is_tail(prev) {
                block::set_next_link(prev, block);
                block::set_prev_link(block, prev);
                block::set_tail(block);
                return;
            }

            let next = next_link(prev);

            if block_size(next) >= size {
                block::set_next_link(block, next);
                block::set_prev_link(next, block);
                block::set_next_link(prev, block);
                block::set_prev_link(block, prev);
                return;
            }

            prev = next;
        }
    }

    /// Unlinks `block` from its bucket.
    ///
    /// # Safety
    /// `block` must be a member of a bucket.
    pub unsafe fn remove(self, block: *mut u8) {
        let prev = prev_link(block);

        if is_tail(block) {
            block::set_tail(prev);
        } else {
            let next = next_link(block);
            block::set_next_link(prev, next);
            block::set_prev_link(next, prev);
        }
    }

    /// Whether `block` is a member of the bucket for `size`.
    #[inline]
    pub unsafe fn contains(self, block: *mut u8, size: usize) -> bool {
        self.members(self.bucket_for(size)).any(|member| member == block)
    }
}

/// An iterator over the members of a bucket, excluding the sentinel.
///
/// This `struct` is created by [`Directory::members`].
#[derive(Debug)]
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Members(Option<*mut u8>);

impl Members {
    unsafe fn new(sentinel: *mut u8) -> Self {
        if is_tail(sentinel) {
            Self(None)
        } else {
            Self(Some(next_link(sentinel)))
        }
    }
}

impl Iterator for Members {
    type Item = *mut u8;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let current = self.0?;
        self.0 = unsafe { if is_tail(current) { None } else { Some(next_link(current)) } };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::block::set_free;

    #[test]
    fn directory_layout() {
        assert_eq!(DIRECTORY_SIZE, 260);
        assert_eq!((DIRECTORY_SIZE + HEADER_SIZE) % 8, 0);
    }

    #[test]
    fn size_classes() {
        assert_eq!(size_class(16), 0);
        assert_eq!(size_class(24), 0);
        assert_eq!(size_class(31), 0);
        assert_eq!(size_class(32), 1);
        assert_eq!(size_class(63), 1);
        assert_eq!(size_class(64), 2);
        assert_eq!(size_class(4104), 8);
        assert_eq!(size_class(1 << 30), 26);
        assert_eq!(size_class(usize::MAX), LIST_TOTAL - 1);
    }

    #[test]
    fn sorted_insert_and_remove() {
        let mut memory = vec![0u64; 256].into_boxed_slice();

        unsafe {
            let base = memory.as_mut_ptr().cast::<u8>();
            let dir = Directory::establish(base);

            for class in 0..LIST_TOTAL {
                assert!(dir.members(dir.sentinel(class)).next().is_none());
            }

            // three blocks of class 1, laid out back to back after the directory
            let a = dir.end();
            let b = a.add(48);
            let c = b.add(40);
            set_free(a, 48);
            set_free(b, 40);
            set_free(c, 56);

            dir.insert(a);
            dir.insert(c);
            dir.insert(b);

            let sentinel = dir.sentinel(1);
            assert!(dir.members(sentinel).eq([b, a, c]));
            assert_eq!(prev_link(b), sentinel);
            assert!(dir.contains(a, 48));
            assert!(!dir.contains(a, 16));

            // equal sizes go ahead of existing members
            let d = c.add(56);
            set_free(d, 40);
            dir.insert(d);
            assert!(dir.members(sentinel).eq([d, b, a, c]));

            dir.remove(a);
            assert!(dir.members(sentinel).eq([d, b, c]));
            dir.remove(c);
            assert!(dir.members(sentinel).eq([d, b]));
            assert!(is_tail(b));
            dir.remove(d);
            assert!(dir.members(sentinel).eq([b]));
            assert_eq!(prev_link(b), sentinel);
            dir.remove(b);
            assert!(dir.members(sentinel).next().is_none());
            assert!(!dir.contains(b, 40));
        }
    }
}
