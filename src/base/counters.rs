//! Track allocation statistics for Segfit.

/// Allocation statistics struct for [`Segfit`](crate::base::Segfit).
///
/// Byte counts are in whole blocks, headers included.
///
/// # Example
///
/// ```
/// # use segfit::{Segfit, ClaimedHeap};
/// static mut ARENA: [u64; 2048] = [0; 2048];
///
/// let mut segfit = Segfit::new(unsafe { ClaimedHeap::array(core::ptr::addr_of_mut!(ARENA)) });
/// segfit.init().unwrap();
/// let counters = segfit.counters();
/// assert_eq!(counters.allocation_count, 0);
/// eprintln!("{}", counters);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Counters {
    /// Number of active allocations.
    pub allocation_count: usize,
    /// Total number of allocations.
    pub total_allocation_count: u64,

    /// Sum of active allocations' block sizes.
    pub allocated_bytes: usize,

    /// Sum of free blocks' sizes.
    pub available_bytes: usize,
    /// Number of free blocks.
    pub fragment_count: usize,

    /// Bytes obtained from the heap provider, directory included.
    pub heap_bytes: usize,
    /// Number of times the heap was extended, including initialization.
    pub heap_extension_count: u64,

    /// Number of resizes that kept their address.
    pub in_place_resize_count: u64,
    /// Number of resizes that moved the allocation.
    pub moved_resize_count: u64,
}

impl Counters {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            allocation_count: 0,
            total_allocation_count: 0,
            allocated_bytes: 0,
            available_bytes: 0,
            fragment_count: 0,
            heap_bytes: 0,
            heap_extension_count: 0,
            in_place_resize_count: 0,
            moved_resize_count: 0,
        }
    }

    /// Returns the number of heap bytes that are neither allocated nor free,
    /// which is the directory.
    #[inline]
    pub const fn overhead_bytes(&self) -> usize {
        self.heap_bytes - self.available_bytes - self.allocated_bytes
    }

    #[inline]
    pub(crate) fn account_register_free(&mut self, size: usize) {
        self.available_bytes += size;
        self.fragment_count += 1;
    }
    #[inline]
    pub(crate) fn account_deregister_free(&mut self, size: usize) {
        self.available_bytes -= size;
        self.fragment_count -= 1;
    }

    #[inline]
    pub(crate) fn account_alloc(&mut self, block_size: usize) {
        self.allocation_count += 1;
        self.allocated_bytes += block_size;

        self.total_allocation_count += 1;
    }

    #[inline]
    pub(crate) fn account_dealloc(&mut self, block_size: usize) {
        self.allocation_count -= 1;
        self.allocated_bytes -= block_size;
    }

    #[inline]
    pub(crate) fn account_resize_in_place(&mut self, old_block_size: usize, new_block_size: usize) {
        self.allocated_bytes += new_block_size - old_block_size;
        self.in_place_resize_count += 1;
    }

    #[inline]
    pub(crate) fn account_resize_moved(&mut self, growth: usize) {
        self.allocated_bytes += growth;
        self.moved_resize_count += 1;
    }

    #[inline]
    pub(crate) fn account_extend(&mut self, increment: usize) {
        self.heap_bytes += increment;
        self.heap_extension_count += 1;
    }
}

impl core::fmt::Display for Counters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            r#"Stat                 | Current Total       | Accumulative Total
---------------------|---------------------|--------------------
# of Allocations     | {:>19} | {:>19}
# of Allocated Bytes | {:>19} |                 N/A
# of Available Bytes | {:>19} |                 N/A
# of Overhead Bytes  | {:>19} |                 N/A
# of Heap Bytes      | {:>19} |                 N/A
# of Extensions      |                 N/A | {:>19}
# of Fragments       | {:>19} |                 N/A
# of Resizes, Kept   |                 N/A | {:>19}
# of Resizes, Moved  |                 N/A | {:>19}"#,
            self.allocation_count,
            self.total_allocation_count,
            self.allocated_bytes,
            self.available_bytes,
            self.overhead_bytes(),
            self.heap_bytes,
            self.heap_extension_count,
            self.fragment_count,
            self.in_place_resize_count,
            self.moved_resize_count,
        )
    }
}

impl<H: crate::heap::HeapProvider> super::Segfit<H> {
    /// Obtain a reference to the internal allocation statistics.
    ///
    /// Reading immediately or cloning the struct is recommended.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use crate::base::DIRECTORY_SIZE;
    use crate::test_utils::segfit_with_capacity;

    #[test]
    fn test_alloc_resize_free() {
        let mut segfit = segfit_with_capacity(1 << 16);
        segfit.init().unwrap();

        let heap_bytes = DIRECTORY_SIZE + 4104;
        let counters = *segfit.counters();
        assert_eq!(counters.heap_bytes, heap_bytes);
        assert_eq!(counters.heap_extension_count, 2);
        assert_eq!(counters.available_bytes, 4104);
        assert_eq!(counters.fragment_count, 1);
        assert_eq!(counters.allocation_count, 0);
        assert_eq!(counters.total_allocation_count, 1);
        assert_eq!(counters.overhead_bytes(), DIRECTORY_SIZE);

        let p = segfit.allocate(100).unwrap();
        let counters = *segfit.counters();
        assert_eq!(counters.allocated_bytes, 136);
        assert_eq!(counters.available_bytes, 4104 - 136);
        assert_eq!(counters.allocation_count, 1);
        assert_eq!(counters.total_allocation_count, 2);
        assert_eq!(counters.fragment_count, 1);

        let p = unsafe { segfit.resize(Some(p), 200) }.unwrap();
        let counters = *segfit.counters();
        assert_eq!(counters.allocated_bytes, 4104);
        assert_eq!(counters.available_bytes, 0);
        assert_eq!(counters.fragment_count, 0);
        assert_eq!(counters.in_place_resize_count, 1);

        let q = unsafe { segfit.resize(Some(p), 8000) }.unwrap();
        assert_eq!(q, p);
        let counters = *segfit.counters();
        assert_eq!(counters.heap_extension_count, 3);
        assert_eq!(counters.in_place_resize_count, 2);
        assert_eq!(counters.heap_bytes, counters.allocated_bytes + DIRECTORY_SIZE);

        unsafe { segfit.free(Some(q)) };
        let counters = *segfit.counters();
        assert_eq!(counters.allocation_count, 0);
        assert_eq!(counters.allocated_bytes, 0);
        assert_eq!(counters.fragment_count, 1);
        assert_eq!(counters.available_bytes + DIRECTORY_SIZE, counters.heap_bytes);

        eprintln!("{}", counters);
    }
}
