//! Block layout.
//!
//! ```not_rust
//!          ALLOCATED BLOCK                 FREE BLOCK
//!         ┌───────────────┐           ┌───────────────┐
//!  4 B    │ size | 1      │    4 B    │ size | 0      │  header
//!         ├───────────────┤           ├───────────────┤
//!         │               │    4 B    │ next offset   │  i32, relative to the block
//!         │               │           ├───────────────┤
//!         │    payload    │    4 B    │ prev offset   │  i32, relative to the block
//!         │               │           ├───────────────┤
//!         │               │           │      ...      │
//!         │               │           ├───────────────┤
//!         │               │    4 B    │ size | 0      │  footer
//!         └───────────────┘           └───────────────┘
//! ```
//!
//! Block addresses are always `4 (mod 8)` so that payloads are 8-aligned.
//! Nothing in here checks its inputs: every function expects the address
//! of a real block (or a bucket sentinel, for the link accessors).

use core::fmt::Debug;

use super::{ALIGNMENT, HEADER_SIZE};

const NEXT_LINK_OFFSET: usize = HEADER_SIZE;
const PREV_LINK_OFFSET: usize = HEADER_SIZE * 2;

/// A block's bit-packed size and flags.
///
/// Sizes are multiples of [`ALIGNMENT`], leaving the low three bits for
/// flags. Only the lowest is in use.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(pub u32);

impl Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size())
            .field("is_allocated", &self.is_allocated())
            .finish()
    }
}

impl Header {
    pub const ALLOCATED_FLAG: u32 = 1 << 0;
    pub const FLAG_MASK: u32 = ALIGNMENT as u32 - 1;
    pub const SIZE_MASK: u32 = !Self::FLAG_MASK;

    #[inline]
    #[track_caller]
    pub fn allocated(size: usize) -> Self {
        debug_assert!(size % ALIGNMENT == 0);
        debug_assert!(size <= Self::SIZE_MASK as usize);

        Header(size as u32 | Self::ALLOCATED_FLAG)
    }

    #[inline]
    #[track_caller]
    pub fn free(size: usize) -> Self {
        debug_assert!(size % ALIGNMENT == 0);
        debug_assert!(size <= Self::SIZE_MASK as usize);

        Header(size as u32)
    }

    #[inline]
    pub fn size(self) -> usize {
        (self.0 & Self::SIZE_MASK) as usize
    }

    #[inline]
    pub fn is_allocated(self) -> bool {
        self.0 & Self::ALLOCATED_FLAG != 0
    }

    /// Free headers and footers have every flag bit clear.
    #[inline]
    pub fn is_free(self) -> bool {
        self.0 & Self::FLAG_MASK == 0
    }
}

#[inline]
pub unsafe fn header(block: *mut u8) -> Header {
    debug_assert!(block as usize % HEADER_SIZE == 0);
    block.cast::<Header>().read()
}

/// Reads the word just below `block`, which is the preceding block's
/// footer if, and only if, the preceding block is free.
#[inline]
pub unsafe fn footer_below(block: *mut u8) -> Header {
    header(block.wrapping_sub(HEADER_SIZE))
}

#[inline]
pub unsafe fn footer_of(block: *mut u8) -> Header {
    header(block.wrapping_add(block_size(block) - HEADER_SIZE))
}

#[inline]
pub unsafe fn block_size(block: *mut u8) -> usize {
    header(block).size()
}

#[inline]
pub unsafe fn is_allocated(block: *mut u8) -> bool {
    header(block).is_allocated()
}

/// Writes an allocated header. Allocated blocks get no footer.
#[inline]
pub unsafe fn set_allocated(block: *mut u8, size: usize) {
    block.cast::<Header>().write(Header::allocated(size));
}

/// Writes a free header and the matching footer.
#[inline]
pub unsafe fn set_free(block: *mut u8, size: usize) {
    debug_assert!(size >= super::MIN_BLOCK_SIZE);

    let header = Header::free(size);
    block.cast::<Header>().write(header);
    block.add(size - HEADER_SIZE).cast::<Header>().write(header);
}

#[inline]
pub unsafe fn next_block(block: *mut u8) -> *mut u8 {
    block.wrapping_add(block_size(block))
}

#[inline]
pub fn payload_of(block: *mut u8) -> *mut u8 {
    block.wrapping_add(HEADER_SIZE)
}

#[inline]
pub fn block_of(payload: *mut u8) -> *mut u8 {
    payload.wrapping_sub(HEADER_SIZE)
}

#[inline]
fn offset_between(from: *mut u8, to: *mut u8) -> i32 {
    let offset = to as isize - from as isize;
    debug_assert!(i32::try_from(offset).is_ok(), "link offset {} out of range", offset);
    offset as i32
}

#[inline]
unsafe fn read_link(block: *mut u8, field: usize) -> *mut u8 {
    let offset = block.add(field).cast::<i32>().read();
    block.wrapping_offset(offset as isize)
}

#[inline]
unsafe fn write_link(block: *mut u8, field: usize, target: *mut u8) {
    block.add(field).cast::<i32>().write(offset_between(block, target));
}

/// The bucket successor of `block`. A tail links to itself.
#[inline]
pub unsafe fn next_link(block: *mut u8) -> *mut u8 {
    read_link(block, NEXT_LINK_OFFSET)
}

#[inline]
pub unsafe fn prev_link(block: *mut u8) -> *mut u8 {
    read_link(block, PREV_LINK_OFFSET)
}

#[inline]
pub unsafe fn set_next_link(block: *mut u8, next: *mut u8) {
    write_link(block, NEXT_LINK_OFFSET, next);
}

#[inline]
pub unsafe fn set_prev_link(block: *mut u8, prev: *mut u8) {
    write_link(block, PREV_LINK_OFFSET, prev);
}

#[inline]
pub unsafe fn set_tail(block: *mut u8) {
    set_next_link(block, block);
}

/// Whether `block` is the last member of its bucket (or, for a sentinel,
/// whether the bucket is empty).
#[inline]
pub unsafe fn is_tail(block: *mut u8) -> bool {
    block.add(NEXT_LINK_OFFSET).cast::<i32>().read() == 0
}
