//! Boot-time glue between the multiboot2 parser and the buddy allocator:
//! turns the loader's memory map into `add_region`/`reserve_region` calls
//! and carries the RSDP physical address forward to `acpi::init`.

use crate::arch::x86_64::multiboot;
use crate::config::{
    BSP_STACK_SLACK, FALLBACK_MEM_BASE, FALLBACK_MEM_END, TRAMPOLINE_PHYS_ADDR,
    TRAMPOLINE_PHYS_END,
};
use crate::error::KernelResult;
use crate::mm::buddy::{BuddyAllocator, FrameNumber, PhysicalAddress};

extern "C" {
    static _kernel_start: u8;
    static _kernel_end: u8;
    static _outer_data_start: u8;
    static _monitor_private_start: u8;
    static _monitor_private_end: u8;
}

/// Outcome of populating the PMM from the boot-time memory map: the
/// highest usable frame number, needed to size the PCD array, and the RSDP
/// physical address (if the loader supplied one) for `acpi::init`.
pub struct PopulatedMemory {
    pub highest_frame: u64,
    pub rsdp_phys: Option<u64>,
}

/// Phase 1 of mm bring-up (spec §9 two-phase note): feed every region
/// multiboot2 reports available to `pmm`, falling back to a hard-coded
/// 2 MiB-128 MiB window if the loader supplied neither `BASIC_MEMINFO` nor
/// `MMAP` (spec §6), then reserve the AP trampoline page, the kernel
/// image, and the BSP boot stack + slack out of whatever landed in the
/// allocator.
pub fn parse_and_populate(multiboot_info_addr: u32, pmm: &BuddyAllocator) -> KernelResult<PopulatedMemory> {
    // SAFETY: `multiboot_info_addr` is the physical address multiboot2
    // passed to the kernel entry point in ebx, identity-mapped and
    // untouched since.
    let info = unsafe { multiboot::parse(multiboot_info_addr) };

    let mut highest = 0u64;
    let mut any_region = false;
    for region in info.regions() {
        any_region = true;
        pmm.add_region(PhysicalAddress::new(region.base), region.length)?;
        let region_end = region.base + region.length;
        if region_end > 0 {
            highest = highest.max((region_end - 1) / crate::config::FRAME_SIZE as u64);
        }
    }

    if !any_region {
        println!("[MM] multiboot2 supplied no memory map, using fallback region");
        pmm.add_region(
            PhysicalAddress::new(FALLBACK_MEM_BASE),
            FALLBACK_MEM_END - FALLBACK_MEM_BASE,
        )?;
        highest = (FALLBACK_MEM_END - 1) / crate::config::FRAME_SIZE as u64;
    }

    pmm.reserve_region(
        PhysicalAddress::new(TRAMPOLINE_PHYS_ADDR),
        TRAMPOLINE_PHYS_END - TRAMPOLINE_PHYS_ADDR,
    )?;

    // SAFETY: `_kernel_start`/`_kernel_end` are linker-provided symbols, not
    // objects; only their addresses are ever taken.
    let (kernel_start, kernel_end) = unsafe {
        (
            &_kernel_start as *const u8 as u64,
            &_kernel_end as *const u8 as u64,
        )
    };
    pmm.reserve_region(PhysicalAddress::new(kernel_start), kernel_end - kernel_start)?;
    pmm.reserve_region(PhysicalAddress::new(kernel_end), BSP_STACK_SLACK)?;

    println!(
        "[MM] populated: {} pages free of {} total",
        pmm.stats().free_pages,
        pmm.stats().total_pages
    );

    Ok(PopulatedMemory {
        highest_frame: highest,
        rsdp_phys: info.rsdp_phys,
    })
}

/// Helper retained for call sites that only need a `FrameNumber` view of
/// the kernel image bounds (the monitor's dual-view construction stamps
/// these frames `NK_NORMAL` explicitly rather than trusting the PMM
/// default).
pub fn kernel_image_frames() -> (FrameNumber, FrameNumber) {
    // SAFETY: see above.
    let (start, end) = unsafe {
        (
            &_kernel_start as *const u8 as u64,
            &_kernel_end as *const u8 as u64,
        )
    };
    (
        PhysicalAddress::new(start).as_frame(),
        PhysicalAddress::new(end).as_frame(),
    )
}

/// The outer kernel's own read-write working set within the kernel image:
/// ordinary `.data`/`.bss` (heap backing storage, the SMP `CpuSlot` table,
/// the serial port lock, the AP boot stack, ...), carved around
/// `.monitor_private` (the buddy descriptor pool and the PCD table wrapper,
/// see `mm/buddy.rs`/`mm/pcd.rs`). Everything these two windows cover must
/// be ceded `OK_NORMAL` before `monitor::init` builds the OuterView, or the
/// very first write to any of it after the CR3/CR0.WP switch page-faults
/// (spec §4.5.1, §9 "implementations ... adapt").
pub fn outer_working_set_regions() -> [(PhysicalAddress, u64); 2] {
    // SAFETY: linker-provided boundary symbols; only their addresses are
    // taken, same as `_kernel_start`/`_kernel_end` above.
    let (outer_data_start, priv_start, priv_end, kernel_end) = unsafe {
        (
            &_outer_data_start as *const u8 as u64,
            &_monitor_private_start as *const u8 as u64,
            &_monitor_private_end as *const u8 as u64,
            &_kernel_end as *const u8 as u64,
        )
    };
    [
        (PhysicalAddress::new(outer_data_start), priv_start - outer_data_start),
        (PhysicalAddress::new(priv_end), kernel_end - priv_end),
    ]
}
