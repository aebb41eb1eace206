//! Installs and patches the real-mode AP bootstrap blob (spec §4.6 step
//! 2a). The blob itself lives in `arch::x86_64::ap_trampoline` (the raw
//! assembly); this module only copies it down to its fixed physical run
//! address once at boot and patches the two values that differ per AP
//! (the shared OuterView CR3, and a stack top) immediately before each
//! STARTUP IPI.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{AP_STACK_SIZE, TRAMPOLINE_PHYS_ADDR, TRAMPOLINE_PHYS_END};
use crate::error::{KernelError, KernelResult};
use crate::mm::PhysicalAddress;

extern "C" {
    static _ap_trampoline_start: u8;
    static _ap_trampoline_end: u8;
    static _ap_trampoline_lma: u8;
    static mut ap_trampoline_cr3: u64;
    static mut ap_trampoline_stack_top: u64;
}

static HIGHEST_FRAME: AtomicU64 = AtomicU64::new(0);

/// Entry point the trampoline's 64-bit stub jumps to once paging and long
/// mode are live. An ordinary function, not relocated -- the linker gives
/// it a normal kernel-image address, unlike the bootstrap code ahead of it
/// in `ap_trampoline.S` which has to run at a fixed low address.
#[no_mangle]
extern "C" fn ap_entry64_trampoline() -> ! {
    let highest_frame = HIGHEST_FRAME.load(Ordering::Acquire);
    crate::smp::bringup::ap_entry(highest_frame)
}

/// Shared stack every AP's trampoline runs on before handing off to
/// `ap_entry`. Reusable because bring-up is strictly sequential --
/// `smp::bringup::bring_up_one` waits for the current AP to reach `Ready`
/// before starting the next one -- so at most one CPU is ever executing
/// the trampoline at a time.
#[repr(align(16))]
struct ApBootStack([u8; AP_STACK_SIZE]);
static mut AP_BOOT_STACK: ApBootStack = ApBootStack([0; AP_STACK_SIZE]);

/// Copy the trampoline blob down to `TRAMPOLINE_PHYS_ADDR`. Must run once,
/// early in boot -- after the reserved region has been carved out of the
/// PMM (`mm::boot::parse_and_populate`) but before `monitor::init` strips
/// write access from `NK_NORMAL` frames in the OuterView, since this still
/// writes through the bootloader's fully-writable identity map.
///
/// The caller is responsible for retagging `[TRAMPOLINE_PHYS_ADDR,
/// TRAMPOLINE_PHYS_END)` `OK_NORMAL` in the PCD right after this returns,
/// so later `patch_for` calls keep working once the OuterView is live.
pub fn install(highest_frame: u64) -> KernelResult<()> {
    HIGHEST_FRAME.store(highest_frame, Ordering::Release);

    // SAFETY: all three symbols are linker-provided labels; reading their
    // addresses has no side effects. `_ap_trampoline_start`/`_end` are
    // labels *inside* the `.ap_trampoline` section, so the linker resolves
    // them to the section's VMA (0x7000-relative) -- useless as a copy
    // source before the copy has happened. `_ap_trampoline_lma`, set just
    // ahead of the section in linker.ld, gives the address the bytes are
    // actually stored at within this loaded image.
    let (vma_start, vma_end, lma_start) = unsafe {
        (
            &_ap_trampoline_start as *const u8 as usize,
            &_ap_trampoline_end as *const u8 as usize,
            &_ap_trampoline_lma as *const u8 as usize,
        )
    };
    let len = vma_end - vma_start;
    if TRAMPOLINE_PHYS_ADDR + len as u64 > TRAMPOLINE_PHYS_END {
        return Err(KernelError::ResourceExhausted {
            resource: "AP trampoline reserved region",
        });
    }

    // SAFETY: `lma_start` points at the blob's actual storage inside the
    // read-only kernel image; the destination is the reserved physical
    // range carved out of the PMM before this runs and identity-mapped by
    // the boot-time page tables still active at this point. The ranges do
    // not overlap (the destination is below 1 MiB, the image starts at
    // `_kernel_start` == 1 MiB).
    unsafe {
        core::ptr::copy_nonoverlapping(lma_start as *const u8, TRAMPOLINE_PHYS_ADDR as *mut u8, len);
    }

    println!(
        "[smp] AP trampoline installed: {len} bytes at {:#x}",
        TRAMPOLINE_PHYS_ADDR
    );
    Ok(())
}

/// Patch the OuterView CR3 and this boot's stack top into the
/// already-installed trampoline. Called once per AP, immediately before
/// `apic::send_init_startup_sequence` names `TRAMPOLINE_PHYS_ADDR` as that
/// AP's entry page.
pub fn patch_for(outer_root: PhysicalAddress) {
    // SAFETY: `ap_trampoline_cr3`/`ap_trampoline_stack_top` are linked at
    // the same fixed VMA (`TRAMPOLINE_PHYS_ADDR`-relative) the trampoline
    // runs at once copied, so writing through them writes the live,
    // about-to-execute bytes. The destination page is retagged `OK_NORMAL`
    // by `install`'s caller, so this write does not fault under the
    // OuterView's write-strip. Bring-up is sequential, so no other CPU is
    // reading these slots concurrently.
    unsafe {
        let stack_top = (&raw const AP_BOOT_STACK as usize) + AP_STACK_SIZE;
        core::ptr::write_volatile(core::ptr::addr_of_mut!(ap_trampoline_cr3), outer_root.as_u64());
        core::ptr::write_volatile(
            core::ptr::addr_of_mut!(ap_trampoline_stack_top),
            stack_top as u64,
        );
    }
}
