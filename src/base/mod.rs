//! This module provides the core allocation mechanism via the [`Segfit`] type and its constants.

use core::{fmt::Debug, ptr::NonNull};

use crate::heap::{HeapExhausted, HeapProvider};
use crate::ptr_utils;
use block::{block_size, payload_of};
use directory::{size_class, Directory};

mod block;
mod check;
mod directory;
mod free;
mod resize;

pub use check::{CheckError, CheckOptions};
pub use directory::DIRECTORY_SIZE;

#[cfg(feature = "counters")]
mod counters;
#[cfg(feature = "counters")]
pub use counters::Counters;

/// Alignment of every block and payload, and the granularity of block sizes.
pub const ALIGNMENT: usize = 8;
/// Size of a block header, a free block's footer, and each link field.
pub const HEADER_SIZE: usize = 4;
/// The smallest block: a header, two links, and a footer.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE * 4;
/// Number of size-class buckets in the free-list directory.
pub const LIST_TOTAL: usize = 32;
/// Requests below this are rounded up to a power of two.
/// Also the least the heap is extended by when no free block fits.
pub const MALLOC_BUFFER: usize = 4096;
/// Resize requests below this are rounded up to a power of two.
/// A free predecessor is only absorbed by a resize if it's larger than this.
pub const REALLOC_BUFFER: usize = 256;
/// The most bytes a [`Segfit`] will manage, directory included.
///
/// Headers and link offsets are 32 bits wide, which bounds the heap.
pub const MAX_HEAP_SIZE: usize = i32::MAX as usize & !(ALIGNMENT - 1);

/// Returns the block size needed to hold `size` bytes of payload,
/// or `None` if no heap could ever hold it.
#[inline]
pub(crate) const fn required_block_size(size: usize) -> Option<usize> {
    if size < ALIGNMENT {
        return Some(MIN_BLOCK_SIZE);
    }

    let block_size = ptr_utils::align_size_up(size.saturating_add(HEADER_SIZE), ALIGNMENT - 1);

    if block_size <= MAX_HEAP_SIZE - DIRECTORY_SIZE {
        Some(block_size)
    } else {
        None
    }
}

/// The core allocator type.
///
/// [`Segfit`] manages a single contiguous heap obtained from a [`HeapProvider`],
/// keeping free blocks in [`LIST_TOTAL`] size-segregated buckets, each sorted by size.
/// Allocations are served best-fit from the buckets, falling back on growing the heap.
///
/// Allocated blocks carry a 4-byte header and no footer; payloads are aligned to [`ALIGNMENT`].
///
/// To use [`Segfit`] via the [`GlobalAlloc`](core::alloc::GlobalAlloc) or
/// [`Allocator`](allocator_api2::alloc::Allocator) APIs, wrap it in a
/// [`SegfitCell`](crate::cell::SegfitCell).
///
/// # Example
/// ```
/// # use segfit::{Segfit, ClaimedHeap};
/// static mut ARENA: [u64; 4096] = [0; 4096];
///
/// let mut segfit = Segfit::new(unsafe { ClaimedHeap::array(core::ptr::addr_of_mut!(ARENA)) });
/// segfit.init().unwrap();
///
/// let ptr = segfit.allocate(100).unwrap();
/// unsafe { segfit.free(Some(ptr)); }
///
/// assert!(segfit.check().is_ok());
/// ```
pub struct Segfit<H: HeapProvider> {
    /// Allocation statistics.
    #[cfg(feature = "counters")]
    counters: Counters,

    directory: Option<Directory>,
    heap: H,
}

unsafe impl<H: HeapProvider + Send> Send for Segfit<H> {}

impl<H: HeapProvider> Debug for Segfit<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut debug_struct = f.debug_struct("Segfit");

        debug_struct
            .field("directory", &self.directory.map(Directory::base))
            .field("heap", &self.heap);

        #[cfg(feature = "counters")]
        {
            debug_struct.field("counters", &self.counters);
        }

        debug_struct.finish()
    }
}

impl<H: HeapProvider> Segfit<H> {
    /// Create a new [`Segfit`] over `heap`.
    ///
    /// Nothing is written to the heap until [`init`](Self::init) is called.
    pub const fn new(heap: H) -> Self {
        Self {
            #[cfg(feature = "counters")]
            counters: Counters::new(),

            directory: None,
            heap,
        }
    }

    /// Establish the free-list directory at the current end of the heap
    /// and seed it with one free block of [`MALLOC_BUFFER`] bytes.
    ///
    /// Calling this again after it has succeeded does nothing.
    ///
    /// If the directory was established but the seed block could not be
    /// obtained, the allocator is still initialized, but this returns an error.
    pub fn init(&mut self) -> Result<(), HeapExhausted> {
        if self.directory.is_some() {
            return Ok(());
        }

        let base = match self.heap.extend(DIRECTORY_SIZE) {
            Ok(base) => base.as_ptr(),
            Err(err) => {
                log::trace!(target: "segfit", "no room for the free list directory");
                return Err(err);
            }
        };

        debug_assert!(ptr_utils::is_aligned_to(base, ALIGNMENT));

        #[cfg(feature = "counters")]
        self.counters.account_extend(DIRECTORY_SIZE);

        // SAFETY: the provider just handed over these bytes
        self.directory = Some(unsafe { Directory::establish(base) });
        log::trace!(target: "segfit", "established the free list directory at {:p}", base);

        let seed = self.allocate(MALLOC_BUFFER).ok_or(HeapExhausted)?;
        // SAFETY: just allocated
        unsafe { self.free(Some(seed)) };

        Ok(())
    }

    /// Whether the directory has been established.
    #[inline]
    pub const fn is_initialized(&self) -> bool {
        self.directory.is_some()
    }

    /// The heap provider.
    #[inline]
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// The heap provider, mutably.
    ///
    /// # Safety
    /// Once initialized, the heap must not be modified, moved, or shrunk through this reference.
    #[inline]
    pub unsafe fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    /// Tear down the allocator, returning the heap provider.
    ///
    /// Every outstanding allocation is invalidated as far as this allocator is concerned.
    pub fn into_heap(self) -> H {
        self.heap
    }

    /// Allocate at least `size` bytes, aligned to [`ALIGNMENT`].
    ///
    /// Returns `None` if `size` is zero, if the allocator is not initialized,
    /// or if the heap provider is exhausted.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let dir = self.directory?;

        let size = if size < MALLOC_BUFFER { size.next_power_of_two() } else { size };
        let need = required_block_size(size)?;

        // SAFETY: the directory and every block it reaches are maintained by self
        unsafe {
            let block = match self.find_fit(dir, need) {
                Some(block) => {
                    self.deregister_free(dir, block);
                    block
                }
                None => {
                    let increment = need.max(MALLOC_BUFFER);
                    let block = self.extend_heap(dir, increment)?;
                    block::set_free(block, increment);
                    block
                }
            };

            self.split(dir, block, need);

            Some(NonNull::new_unchecked(payload_of(block)))
        }
    }

    /// Returns the number of payload bytes usable in the allocation at `ptr`.
    ///
    /// This is at least what was requested, often more.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this allocator.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        block_size(block::block_of(ptr.as_ptr())) - HEADER_SIZE
    }

    /// Iterates over every block in the heap, in address order.
    ///
    /// Iteration ends early if a block's size is zero, which only happens if the heap is corrupt.
    pub fn blocks(&self) -> Blocks {
        match self.directory {
            Some(dir) => Blocks { cursor: dir.end(), acme: self.heap.acme() },
            None => Blocks { cursor: core::ptr::null_mut(), acme: core::ptr::null_mut() },
        }
    }

    /// Whether `ptr` lies below the current end of the heap.
    #[inline]
    fn is_within_heap(&self, ptr: *mut u8) -> bool {
        ptr < self.heap.acme()
    }

    /// Finds the smallest block of at least `need` bytes in the smallest nonempty
    /// bucket that has one.
    #[inline]
    unsafe fn find_fit(&self, dir: Directory, need: usize) -> Option<*mut u8> {
        (size_class(need)..LIST_TOTAL)
            .flat_map(|class| dir.members(dir.sentinel(class)))
            .find(|&block| block_size(block) >= need)
    }

    /// Marks `block` allocated, carving off a free remainder if one fits.
    ///
    /// `block` must not be in the directory.
    unsafe fn split(&mut self, dir: Directory, block: *mut u8, need: usize) {
        let size = block_size(block);
        debug_assert!(size >= need);

        let size = if size - need > ALIGNMENT {
            self.register_free(dir, block.add(need), size - need);
            need
        } else {
            size
        };

        block::set_allocated(block, size);

        #[cfg(feature = "counters")]
        self.counters.account_alloc(size);
    }

    /// Writes a free block at `block` and files it in the directory.
    #[inline]
    unsafe fn register_free(&mut self, dir: Directory, block: *mut u8, size: usize) {
        block::set_free(block, size);
        dir.insert(block);

        #[cfg(feature = "counters")]
        self.counters.account_register_free(size);
    }

    #[inline]
    unsafe fn deregister_free(&mut self, dir: Directory, block: *mut u8) {
        #[cfg(feature = "counters")]
        self.counters.account_deregister_free(block_size(block));

        dir.remove(block);
    }

    /// Grows the heap by `increment` bytes, returning the start of the new bytes.
    #[cold]
    fn extend_heap(&mut self, dir: Directory, increment: usize) -> Option<*mut u8> {
        let old_acme = self.heap.acme();
        let managed = old_acme as usize - dir.base() as usize;

        if increment > MAX_HEAP_SIZE - managed {
            log::trace!(
                target: "segfit",
                "extending the heap by {} bytes would pass the {} byte limit",
                increment,
                MAX_HEAP_SIZE
            );
            return None;
        }

        match self.heap.extend(increment) {
            Ok(new_bytes) => {
                debug_assert_eq!(new_bytes.as_ptr(), old_acme);
                log::trace!(target: "segfit", "extended the heap by {} bytes", increment);

                #[cfg(feature = "counters")]
                self.counters.account_extend(increment);

                Some(new_bytes.as_ptr())
            }
            Err(HeapExhausted) => {
                log::trace!(target: "segfit", "heap exhausted extending by {} bytes", increment);
                None
            }
        }
    }
}

/// A block in the heap, as reported by [`Segfit::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block's header.
    pub addr: *mut u8,
    /// Size of the block in bytes, header included.
    pub size: usize,
    /// Whether the block is allocated.
    pub is_allocated: bool,
}

impl BlockInfo {
    /// The address handed out for this block when it's allocated.
    pub fn payload(&self) -> *mut u8 {
        payload_of(self.addr)
    }
}

/// An iterator over the blocks of a [`Segfit`] heap.
///
/// This `struct` is created by [`Segfit::blocks`].
#[derive(Debug, Clone)]
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Blocks {
    cursor: *mut u8,
    acme: *mut u8,
}

impl Iterator for Blocks {
    type Item = BlockInfo;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.acme {
            return None;
        }

        // SAFETY: every block below the end of the heap starts with a header
        let header = unsafe { block::header(self.cursor) };
        let info =
            BlockInfo { addr: self.cursor, size: header.size(), is_allocated: header.is_allocated() };

        self.cursor = if info.size == 0 { self.acme } else { self.cursor.wrapping_add(info.size) };

        Some(info)
    }
}
