#![no_main]

use std::ptr::NonNull;

use segfit::*;

use libfuzzer_sys::fuzz_target;

use libfuzzer_sys::arbitrary::Arbitrary;

const ARENA_SIZE: usize = 1 << 22;

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate memory with the given size
    Alloc { size: u16 },
    /// Free the ith allocation
    Free { index: u8 },
    /// Resize the ith allocation
    Resize { index: u8, new_size: u16 },
}
use Actions::*;

fuzz_target!(|actions: Vec<Actions>| {
    let mut memory = vec![0u64; ARENA_SIZE / 8];
    let heap = unsafe { ClaimedHeap::new(memory.as_mut_ptr().cast(), ARENA_SIZE) };
    let mut segfit = Segfit::new(heap);
    segfit.init().unwrap();

    // pointer, requested size, fill byte
    let mut allocations: Vec<(NonNull<u8>, usize, u8)> = vec![];

    for (step, action) in actions.into_iter().enumerate() {
        let fill = step as u8;

        match action {
            Alloc { size } => {
                let size = size as usize;

                if let Some(ptr) = segfit.allocate(size) {
                    assert!(size != 0);
                    assert_eq!(ptr.as_ptr() as usize % 8, 0);
                    unsafe { ptr.as_ptr().write_bytes(fill, size) };
                    allocations.push((ptr, size, fill));
                }
            }
            Free { index } => {
                if index as usize >= allocations.len() { continue; }

                let (ptr, size, fill) = allocations.swap_remove(index as usize);
                unsafe {
                    assert!(std::slice::from_raw_parts(ptr.as_ptr(), size).iter().all(|&b| b == fill));
                    segfit.free(Some(ptr));
                }
            }
            Resize { index, new_size } => {
                if index as usize >= allocations.len() { continue; }
                if new_size == 0 { continue; }

                let (ptr, old_size, old_fill) = allocations[index as usize];
                let new_size = new_size as usize;

                if let Some(ptr) = unsafe { segfit.resize(Some(ptr), new_size) } {
                    let kept = old_size.min(new_size);
                    unsafe {
                        let bytes = std::slice::from_raw_parts(ptr.as_ptr(), kept);
                        assert!(bytes.iter().all(|&b| b == old_fill));
                        ptr.as_ptr().write_bytes(old_fill, new_size);
                    }
                    allocations[index as usize] = (ptr, new_size, old_fill);
                }
            }
        }

        if let Err(err) = segfit.check() {
            panic!("heap inconsistent after {:?}: {}", step, err);
        }
    }

    for (ptr, _, _) in allocations {
        unsafe { segfit.free(Some(ptr)) };
    }

    assert_eq!(segfit.check(), Ok(()));
    assert_eq!(segfit.blocks().filter(|b| b.is_allocated).count(), 0);
    assert_eq!(segfit.counters().allocation_count, 0);
});
