//! BSP/AP bring-up sequencing (spec §4.6).
//!
//! The BSP (`bring_up_all`) walks the ACPI-enumerated APIC IDs and drives
//! each AP's `CpuSlot` through `Offline -> Booting`, using the existing
//! `apic::send_init_startup_sequence` (already written to the classic Intel
//! SDM INIT-deassert-STARTUP-STARTUP recipe) to actually wake the core, then
//! bounded-spin-waits for that slot to reach `Ready`. Each AP, running
//! `ap_entry` after the real-mode trampoline hands off to 64-bit code, walks
//! its own slot the rest of the way: `Online` once it has loaded the shared
//! OuterView CR3 and set CR0.WP, `Ready` once the invariant verifier has run.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::apic;
use crate::config::{AP_READY_SPIN_LIMIT, TRAMPOLINE_PHYS_ADDR};
use crate::error::{KernelError, KernelResult};
use crate::monitor;
use crate::smp::cpu::{self, CpuState};

static BSP_READY: AtomicBool = AtomicBool::new(false);

/// Whether the BSP has finished its own init and published `bsp_ready`
/// (spec §4.6 step 1). Polled by every AP before it touches shared state.
pub fn bsp_ready() -> bool {
    BSP_READY.load(Ordering::Acquire)
}

/// Run on the BSP once its own IDT/APIC/PMM/PCD/Monitor init has completed.
/// Registers the BSP's own slot (already `Ready`, it never goes through the
/// AP transitions), publishes `bsp_ready`, then brings up every other
/// ACPI-enumerated, usable AP in turn. An AP that times out is left
/// `Offline`; boot continues on the remaining CPUs (spec §4.6 closing
/// sentence).
pub fn bring_up_all(bsp_apic_id: u32, highest_frame: u64) -> KernelResult<usize> {
    cpu::register_bsp(bsp_apic_id)?;

    BSP_READY.store(true, Ordering::Release);
    crate::arch::x86_64::mfence();

    let cpus = crate::arch::x86_64::acpi::find_madt_cpus().unwrap_or_default();
    let mut brought_up = 1; // the BSP itself

    for (apic_id, _acpi_processor_id, usable) in cpus {
        if apic_id == bsp_apic_id || !usable {
            continue;
        }
        match bring_up_one(apic_id, highest_frame) {
            Ok(()) => brought_up += 1,
            Err(e) => println!("[smp] AP {apic_id}: bring-up failed: {e}"),
        }
    }

    Ok(brought_up)
}

fn bring_up_one(apic_id: u32, _highest_frame: u64) -> KernelResult<()> {
    let slot = cpu::register(apic_id)?;

    slot.advance(CpuState::Booting)?;

    // The blob itself was copied down to `TRAMPOLINE_PHYS_ADDR` once during
    // `smp::trampoline::install`, before monitor::init stripped write access
    // from it; only the per-AP CR3/stack-top slots need patching here.
    crate::smp::trampoline::patch_for(monitor::state().outer_root);

    apic::send_init_startup_sequence(apic_id as u8, TRAMPOLINE_PHYS_ADDR)?;

    let mut spins = 0u32;
    while slot.state() != CpuState::Ready {
        if spins >= AP_READY_SPIN_LIMIT {
            return Err(KernelError::ApicTimeout {
                apic_id,
                stage: "AP readiness",
            });
        }
        core::hint::spin_loop();
        spins += 1;
    }

    // Let serial output from the AP settle before moving on to the next one
    // (spec §4.6 step 2e).
    for _ in 0..10_000 {
        core::hint::spin_loop();
    }
    Ok(())
}

/// Entry point for an AP once the real-mode trampoline has handed off to
/// 64-bit code (spec §4.6 step 3). Never returns.
pub fn ap_entry(highest_frame: u64) -> ! {
    while !bsp_ready() {
        core::hint::spin_loop();
    }

    let index = cpu::claim_index();

    let apic_id = apic::read_id().unwrap_or(0) as u32;
    let slot = match cpu::lookup(apic_id) {
        Some(s) => s,
        None => monitor::halt_and_terminate(),
    };
    slot.set_index(index);
    println!("[smp] AP apic_id={apic_id} claimed logical index {index}");

    let outer_root = monitor::state().outer_root;
    crate::arch::x86_64::mmu::write_cr3(outer_root);
    crate::arch::x86_64::mmu::set_cr0_wp();

    if slot.advance(CpuState::Online).is_err() {
        monitor::halt_and_terminate();
    }

    monitor::verify::run(highest_frame, false);

    if slot.advance(CpuState::Ready).is_err() {
        monitor::halt_and_terminate();
    }

    monitor::halt_and_terminate();
}
