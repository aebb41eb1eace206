//! Boot entry point (spec §6): `kernel_main` is handed off to by the
//! firmware-level trampoline with the CPU already in 64-bit mode,
//! identity-mapped over at least the first 1 GiB, paging enabled with a
//! temporary PML4 from the bootloader.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(abi_x86_interrupt)]
#![test_runner(nk_monitor::test_framework::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;

use nk_monitor::arch::x86_64::acpi;
use nk_monitor::arch::x86_64::apic;
use nk_monitor::config::{BSP_STACK_SLACK, TRAMPOLINE_PHYS_ADDR, TRAMPOLINE_PHYS_END};
use nk_monitor::mm::pcd::{pcd, PageType};
use nk_monitor::mm::PhysicalAddress;
use nk_monitor::{mm, monitor, smp};

/// Entry point named by the linker script / bootloader handoff stub.
#[no_mangle]
pub extern "C" fn _start(multiboot_info: u32) -> ! {
    println!("nk-monitor v{}", env!("CARGO_PKG_VERSION"));
    kernel_main(multiboot_info)
}

/// The boot sequence proper (spec §2, §6): architecture bring-up, memory
/// management, the monitor's dual views, SMP bring-up, and the invariant
/// verifier on the BSP. Never returns.
fn kernel_main(multiboot_info: u32) -> ! {
    nk_monitor::log_sink::init();
    nk_monitor::arch::x86_64::init();

    log::info!("parsing multiboot2 info at {:#x}", multiboot_info);
    let mm_init = match mm::init(multiboot_info) {
        Ok(m) => m,
        Err(e) => {
            log::error!("memory management init failed: {e}");
            monitor::halt_and_terminate();
        }
    };

    if let Err(e) = acpi::init(mm_init.rsdp_phys.map(|a| a as usize)) {
        log::warn!("ACPI init failed, continuing single-CPU: {e}");
    }
    if let Err(e) = apic::init() {
        log::error!("APIC init failed: {e}");
        monitor::halt_and_terminate();
    }

    if let Err(e) = smp::trampoline::install(mm_init.highest_frame.as_u64()) {
        log::error!("AP trampoline install failed: {e}");
        monitor::halt_and_terminate();
    }
    let trampoline_base = PhysicalAddress::new(TRAMPOLINE_PHYS_ADDR);
    let trampoline_size = TRAMPOLINE_PHYS_END - TRAMPOLINE_PHYS_ADDR;
    if let Err(e) = pcd().mark_region(trampoline_base, trampoline_size, PageType::OkNormal) {
        log::error!("AP trampoline PCD retag failed: {e}");
        monitor::halt_and_terminate();
    }

    // Cede the outer kernel's own working set -- ordinary `.data`/`.bss`
    // (heap, CpuSlot table, serial lock, AP boot stack, ...) and the BSP
    // boot stack past the kernel image -- before the OuterView goes live.
    // Left un-ceded, the PCD default (`NK_NORMAL`) would write-strip all of
    // it, and the very next stack push after the CR3/CR0.WP switch faults.
    for (base, size) in mm::boot::outer_working_set_regions() {
        if size > 0 {
            if let Err(e) = pcd().mark_region(base, size, PageType::OkNormal) {
                log::error!("outer working-set PCD cede failed: {e}");
                monitor::halt_and_terminate();
            }
        }
    }
    let (_, kernel_end_frame) = mm::boot::kernel_image_frames();
    if let Err(e) = pcd().mark_region(kernel_end_frame.as_addr(), BSP_STACK_SLACK, PageType::OkNormal) {
        log::error!("BSP boot stack PCD cede failed: {e}");
        monitor::halt_and_terminate();
    }

    if let Err(e) = monitor::init(mm_init.highest_frame) {
        log::error!("monitor view construction failed: {e}");
        monitor::halt_and_terminate();
    }

    let bsp_apic_id = apic::read_id().unwrap_or(0) as u32;
    let highest_frame = mm_init.highest_frame.as_u64();

    log::info!("BSP apic_id={bsp_apic_id}, bringing up remaining CPUs");
    match smp::bringup::bring_up_all(bsp_apic_id, highest_frame) {
        Ok(count) => log::info!("{count} CPU(s) online"),
        Err(e) => log::warn!("SMP bring-up failed: {e}"),
    }

    #[cfg(test)]
    test_main();

    let pass = monitor::verify::run(highest_frame, true);
    if pass {
        log::info!("invariant verifier: PASS");
    } else {
        log::error!("invariant verifier: FAIL");
    }

    log::info!("nk-monitor initialized, idling");
    loop {
        nk_monitor::arch::x86_64::idle();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    #[cfg(test)]
    return nk_monitor::test_framework::test_panic_handler(info);

    #[cfg(not(test))]
    {
        println!("[KERNEL PANIC] {info}");
        monitor::halt_and_terminate();
    }
}
