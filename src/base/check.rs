//! Heap consistency checking.
//!
//! This walks the whole heap and every bucket, so it's slow. It's meant for tests and debugging.

use super::block;
use super::directory::{size_class, Directory};
use super::{Segfit, ALIGNMENT, HEADER_SIZE, LIST_TOTAL, MIN_BLOCK_SIZE};
use crate::heap::HeapProvider;

/// Selects what [`Segfit::check_with`] logs and verifies.
///
/// Checks run in the order of the fields below, stopping at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckOptions {
    /// Log each check's outcome, passing or failing.
    pub verbose: bool,
    /// Log every block in the heap.
    pub print_all_blocks: bool,
    /// Log the members of every nonempty bucket.
    pub print_free_lists: bool,

    /// Every bucket member is marked free, and every link stays within the heap.
    pub check_free_list_marks: bool,
    /// No two free blocks are adjacent.
    pub check_coalescing: bool,
    /// Every free block in the heap is in the bucket for its size.
    pub check_membership: bool,
    /// Every free block's footer matches its header.
    pub check_footers: bool,
    /// No block is too small to separate its neighbors.
    pub check_overlap: bool,
    /// Walking the blocks from the bottom of the heap ends exactly at the top.
    pub check_bounds: bool,
    /// Every bucket holds only its own size class, smallest first.
    pub check_bucket_order: bool,
}

impl CheckOptions {
    /// Every check, logging everything.
    pub const fn all() -> Self {
        Self {
            verbose: true,
            print_all_blocks: true,
            print_free_lists: true,
            ..Self::quiet()
        }
    }

    /// Every check, logging nothing.
    pub const fn quiet() -> Self {
        Self {
            verbose: false,
            print_all_blocks: false,
            print_free_lists: false,
            check_free_list_marks: true,
            check_coalescing: true,
            check_membership: true,
            check_footers: true,
            check_overlap: true,
            check_bounds: true,
            check_bucket_order: true,
        }
    }
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self::quiet()
    }
}

/// A broken heap invariant, found by [`Segfit::check`].
///
/// Each variant names the offending block or bucket.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    /// A bucket member isn't marked free.
    #[error("block {block:p} in bucket {bucket} is not marked free")]
    FreeListMark { bucket: usize, block: *mut u8 },
    /// A bucket links to something that can't be a block in this heap.
    #[error("bucket {bucket} links to {block:p}, outside the heap")]
    MemberOutOfBounds { bucket: usize, block: *mut u8 },
    /// A bucket's links loop back on themselves.
    #[error("bucket {bucket} does not terminate")]
    FreeListCycle { bucket: usize },
    /// Two free blocks are adjacent.
    #[error("free blocks {block:p} and {next:p} are adjacent")]
    Uncoalesced { block: *mut u8, next: *mut u8 },
    /// A free block is missing from its bucket.
    #[error("free block {block:p} of {size} bytes is missing from bucket {bucket}")]
    NotInFreeList { block: *mut u8, size: usize, bucket: usize },
    /// A free block's footer doesn't match its header.
    #[error("free block {block:p} has footer {footer:#x} but header {header:#x}")]
    BadFooter { block: *mut u8, header: u32, footer: u32 },
    /// A block is smaller than the minimum, so it overlaps its successor's bookkeeping.
    #[error("block {block:p} of {size} bytes overlaps its successor")]
    Overlap { block: *mut u8, size: usize },
    /// The block walk doesn't end at the top of the heap.
    #[error("walking the blocks ended at {end:p} rather than the heap end {acme:p}")]
    OutOfBounds { end: *mut u8, acme: *mut u8 },
    /// A bucket member is smaller than the one before it.
    #[error("block {block:p} in bucket {bucket} is out of order")]
    BucketOrder { bucket: usize, block: *mut u8 },
    /// A bucket member's size belongs in a different bucket.
    #[error("block {block:p} of {size} bytes is in bucket {bucket}")]
    WrongBucket { bucket: usize, block: *mut u8, size: usize },
}

type Check<H> = fn(&Segfit<H>, Directory) -> Result<(), CheckError>;

impl<H: HeapProvider> Segfit<H> {
    /// Verify every heap invariant, without logging.
    ///
    /// An uninitialized allocator is trivially consistent.
    pub fn check(&self) -> Result<(), CheckError> {
        self.check_with(&CheckOptions::default())
    }

    /// Whether [`check`](Self::check) passes.
    pub fn is_consistent(&self) -> bool {
        self.check().is_ok()
    }

    /// Verify the heap invariants selected by `options`, logging as requested through [`log`].
    pub fn check_with(&self, options: &CheckOptions) -> Result<(), CheckError> {
        let Some(dir) = self.directory else { return Ok(()) };

        if options.print_all_blocks {
            for b in self.blocks() {
                log::info!(
                    target: "segfit",
                    "{:p}: {} bytes, {}",
                    b.addr,
                    b.size,
                    if b.is_allocated { "allocated" } else { "free" }
                );
            }
        }

        if options.print_free_lists {
            for class in 0..LIST_TOTAL {
                let dumped = self.walk_bucket(dir, class, |block| {
                    // SAFETY: walk_bucket only visits addresses within the heap
                    let size = unsafe { block::block_size(block) };
                    log::info!(target: "segfit", "bucket {}: {:p}, {} bytes", class, block, size);
                    Ok(())
                });

                if let Err(err) = dumped {
                    if options.verbose {
                        log::error!(target: "segfit", "bucket {} dump stopped early: {}", class, err);
                    }
                }
            }
        }

        let checks: [(bool, &str, Check<H>); 7] = [
            (options.check_free_list_marks, "free list marks", Self::check_free_list_marks),
            (options.check_coalescing, "coalescing", Self::check_coalescing),
            (options.check_membership, "free list membership", Self::check_membership),
            (options.check_footers, "footers", Self::check_footers),
            (options.check_overlap, "overlap", Self::check_overlap),
            (options.check_bounds, "bounds", Self::check_bounds),
            (options.check_bucket_order, "bucket order", Self::check_bucket_order),
        ];

        for (enabled, name, check) in checks {
            if !enabled {
                continue;
            }

            match check(self, dir) {
                Ok(()) => {
                    if options.verbose {
                        log::info!(target: "segfit", "{} check passed", name);
                    }
                }
                Err(err) => {
                    if options.verbose {
                        log::error!(target: "segfit", "{} check failed: {}", name, err);
                    }
                    return Err(err);
                }
            }
        }

        if options.verbose {
            log::info!(target: "segfit", "heap check found no errors");
        }

        Ok(())
    }

    /// Calls `visit` on each member of bucket `class` in order, refusing to follow
    /// links out of the heap or around in circles.
    fn walk_bucket(
        &self,
        dir: Directory,
        class: usize,
        mut visit: impl FnMut(*mut u8) -> Result<(), CheckError>,
    ) -> Result<(), CheckError> {
        let first = dir.end();
        let acme = self.heap.acme();
        let max_members = (acme as usize - first as usize) / MIN_BLOCK_SIZE;

        let mut current = dir.sentinel(class);
        let mut visited = 0;

        // SAFETY: sentinels are always readable, and every member is bounds-checked before use
        unsafe {
            while !block::is_tail(current) {
                let member = block::next_link(current);

                let in_heap = member >= first && (member as usize) < acme as usize - MIN_BLOCK_SIZE + 1;
                if !in_heap || (member as usize + HEADER_SIZE) % ALIGNMENT != 0 {
                    return Err(CheckError::MemberOutOfBounds { bucket: class, block: member });
                }

                visited += 1;
                if visited > max_members {
                    return Err(CheckError::FreeListCycle { bucket: class });
                }

                visit(member)?;
                current = member;
            }
        }

        Ok(())
    }

    fn check_free_list_marks(&self, dir: Directory) -> Result<(), CheckError> {
        for class in 0..LIST_TOTAL {
            self.walk_bucket(dir, class, |block| {
                // SAFETY: walk_bucket only visits addresses within the heap
                if unsafe { block::header(block) }.is_free() {
                    Ok(())
                } else {
                    Err(CheckError::FreeListMark { bucket: class, block })
                }
            })?;
        }

        Ok(())
    }

    fn check_coalescing(&self, _: Directory) -> Result<(), CheckError> {
        let mut blocks = self.blocks().peekable();

        while let Some(b) = blocks.next() {
            if let Some(next) = blocks.peek() {
                if !b.is_allocated && !next.is_allocated {
                    return Err(CheckError::Uncoalesced { block: b.addr, next: next.addr });
                }
            }
        }

        Ok(())
    }

    fn check_membership(&self, dir: Directory) -> Result<(), CheckError> {
        for b in self.blocks().filter(|b| !b.is_allocated) {
            let bucket = size_class(b.size);
            let mut found = false;

            self.walk_bucket(dir, bucket, |member| {
                found |= member == b.addr;
                Ok(())
            })?;

            if !found {
                return Err(CheckError::NotInFreeList { block: b.addr, size: b.size, bucket });
            }
        }

        Ok(())
    }

    fn check_footers(&self, _: Directory) -> Result<(), CheckError> {
        let acme = self.heap.acme() as usize;

        for b in self.blocks().filter(|b| !b.is_allocated) {
            // a block running off the end is for the bounds check to report
            if b.size < HEADER_SIZE || b.size > acme - b.addr as usize {
                continue;
            }

            // SAFETY: the footer lies within the heap
            let (header, footer) = unsafe { (block::header(b.addr), block::footer_of(b.addr)) };

            if header != footer {
                return Err(CheckError::BadFooter { block: b.addr, header: header.0, footer: footer.0 });
            }
        }

        Ok(())
    }

    fn check_overlap(&self, _: Directory) -> Result<(), CheckError> {
        match self.blocks().find(|b| b.size < MIN_BLOCK_SIZE) {
            Some(b) => Err(CheckError::Overlap { block: b.addr, size: b.size }),
            None => Ok(()),
        }
    }

    fn check_bounds(&self, dir: Directory) -> Result<(), CheckError> {
        let acme = self.heap.acme();
        let mut cursor = dir.end();

        while cursor < acme {
            // SAFETY: cursor is below the end of the heap
            let size = unsafe { block::block_size(cursor) };
            if size == 0 {
                break;
            }
            cursor = cursor.wrapping_add(size);
        }

        if cursor == acme {
            Ok(())
        } else {
            Err(CheckError::OutOfBounds { end: cursor, acme })
        }
    }

    fn check_bucket_order(&self, dir: Directory) -> Result<(), CheckError> {
        for class in 0..LIST_TOTAL {
            let mut last_size = 0;

            self.walk_bucket(dir, class, |block| {
                // SAFETY: walk_bucket only visits addresses within the heap
                let size = unsafe { block::block_size(block) };

                if size_class(size) != class {
                    return Err(CheckError::WrongBucket { bucket: class, block, size });
                }
                if size < last_size {
                    return Err(CheckError::BucketOrder { bucket: class, block });
                }

                last_size = size;
                Ok(())
            })?;
        }

        Ok(())
    }
}
