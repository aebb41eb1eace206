//! Kernel heap.
//!
//! The monitor's own bookkeeping (`Vec<CpuSlot>`, the PCD table backing
//! store, descriptor pool overflow) needs an allocator, but the heap
//! itself holds none of the memory the monitor protects -- it is backed
//! by a small static array, separate from the buddy-managed physical
//! range PCD and the dual page-table views cover.

static mut HEAP_MEMORY: [u8; HEAP_MEMORY_SIZE] = [0; HEAP_MEMORY_SIZE];

const HEAP_MEMORY_SIZE: usize = 4 * 1024 * 1024;

/// Kernel heap start address, kept for display purposes; the allocator is
/// seeded from `HEAP_MEMORY`'s own address, not from this constant.
pub const HEAP_START: usize = crate::arch::x86_64::HEAP_START;

pub fn init() -> Result<(), &'static str> {
    println!("[HEAP] initializing kernel heap, {} KiB", HEAP_MEMORY_SIZE / 1024);

    // SAFETY: HEAP_MEMORY is a process-lifetime static; addr_of_mut! avoids
    // forming a `&mut` to a `static mut`, and this runs once before any
    // other CPU is online, so there is no concurrent access.
    unsafe {
        let heap_start = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
        crate::get_allocator().lock().init(heap_start, HEAP_MEMORY_SIZE);
    }

    println!("[HEAP] ready");
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    #[test]
    fn heap_allocation() {
        let x = Box::new(42);
        assert_eq!(*x, 42);

        let mut v = Vec::new();
        for i in 0..100 {
            v.push(i);
        }
        assert_eq!(v.len(), 100);
    }
}
