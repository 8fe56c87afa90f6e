//! # Single-Task Kernel
//!
//! What is left of the kernel when task management is compiled out: one
//! global heap running the eager free policy. Everything is allocated on
//! behalf of the single context, so [`reclaim_all`] hands back every block
//! the program still holds.
//!
//! Heap calls run with interrupts masked and are safe from interrupt
//! handlers as well. Re-exported as `kernel` in this configuration, so code
//! calling `kernel::malloc` builds either way.

use core::cell::RefCell;
use core::ops::Range;
use core::ptr::NonNull;

use critical_section::Mutex;

use crate::err::{fatal, AllocError};
use crate::heap::{FreePolicy, Heap, Owner};

static HEAP: Mutex<RefCell<Option<Heap<'static>>>> = Mutex::new(RefCell::new(None));

fn with_heap<R>(f: impl FnOnce(&mut Heap<'static>) -> R) -> R {
    critical_section::with(|cs| match HEAP.borrow_ref_mut(cs).as_mut() {
        Some(h) => f(h),
        None => fatal("kernel used before init"),
    })
}

fn install(heap: Heap<'static>) {
    log::debug!("single-task heap at {:#x}, {} bytes", heap.base_addr(), heap.capacity());
    critical_section::with(|cs| *HEAP.borrow_ref_mut(cs) = Some(heap));
}

/// Manage all of `region` as the heap.
pub fn init(region: &'static mut [usize]) {
    install(Heap::new(region, FreePolicy::Eager));
}

/// Manage `region` minus the `reserved` word ranges.
pub fn init_with_reserved(
    region: &'static mut [usize],
    reserved: &[Range<usize>],
) -> Result<(), AllocError> {
    install(Heap::with_reserved(region, FreePolicy::Eager, reserved)?);
    Ok(())
}

pub fn malloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    with_heap(|h| h.allocate(size, Owner::Single))
}

pub fn calloc(count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    with_heap(|h| h.allocate_zeroed(count, size, Owner::Single))
}

/// Release a block and merge it with its free neighbours.
pub fn free(ptr: *mut u8) -> Result<(), AllocError> {
    with_heap(|h| h.free(ptr))
}

/// Release every allocated block. Returns how many there were.
pub fn reclaim_all() -> usize {
    with_heap(|h| h.reclaim_all(Owner::Single))
}

pub fn free_bytes() -> usize {
    with_heap(|h| h.free_bytes())
}

pub fn defragment() {
    with_heap(|h| h.defragment());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HEADER_WORDS, WORD};
    use core::ptr::addr_of_mut;

    static mut REGION: [usize; 128] = [0; 128];

    // One test only: the heap is a global.
    #[test]
    fn test_single_task_heap_lifecycle() {
        let region = unsafe { &mut *addr_of_mut!(REGION) };
        init(region);
        let total = free_bytes();
        assert_eq!(total, 128 * WORD);

        let a = malloc(16).unwrap();
        let b = calloc(4, 4).unwrap();
        let _c = malloc(32).unwrap();

        free(a.as_ptr()).unwrap();
        free(b.as_ptr()).unwrap();
        assert_eq!(free(a.as_ptr()), Err(AllocError::DoubleFree));

        // `a` and `b` were merged on free, so their space comes back as one
        // block, header included.
        let d = malloc(16 + 16 + HEADER_WORDS * WORD).unwrap();
        assert_eq!(d, a);

        assert_eq!(reclaim_all(), 2);
        assert_eq!(free_bytes(), total);

        defragment();
        assert_eq!(free_bytes(), total);
    }
}
