//! The nested-kernel monitor: the trusted component that retains full
//! read/write access to all of physical memory while the rest of the system
//! runs under an outer view with write access stripped from the pages the
//! monitor has marked protected (spec §2, §4.5).
//!
//! Three pieces, one per file:
//! - `view`: builds the MonitorView/OuterView page-table hierarchies.
//! - `trampoline`: the `MonitorCall` dispatch surface crossed via a CR3
//!   bracket.
//! - `verify`: the six boot-time invariant checks (spec §4.5.4).

pub mod trampoline;
pub mod verify;
pub mod view;

use crate::arch::x86_64::mmu;
use crate::error::KernelResult;
use crate::mm::buddy::{FrameNumber, PhysicalAddress};
use spin::Once;

/// The two page-table roots, set once at boot and never reallocated.
pub struct MonitorState {
    pub monitor_root: PhysicalAddress,
    pub outer_root: PhysicalAddress,
}

static STATE: Once<MonitorState> = Once::new();

/// Access the monitor's roots. Panics if called before `init` -- every
/// caller in this crate only runs after the boot path has completed monitor
/// bring-up, the same assumption `mm::pcd::pcd()`/`mm::buddy::pmm()` make
/// about their own global state.
pub fn state() -> &'static MonitorState {
    STATE.get().expect("monitor::init was not called before monitor::state()")
}

/// Build both views, switch the running CPU onto the OuterView, and set
/// CR0.WP (spec §4.5.1: "After construction, CR3 is loaded with the
/// OuterView root and CR0.WP is set").
///
/// Must run exactly once, on the BSP, before any AP is started -- the views
/// this builds are shared by every CPU (spec §4.6 step 2b loads the same
/// OuterView root on each AP as it comes online).
pub fn init(highest_frame: FrameNumber) -> KernelResult<()> {
    log::info!("constructing MonitorView/OuterView over {} frames", highest_frame.as_u64() + 1);
    let roots = view::construct(highest_frame)?;
    let state = STATE.call_once(|| MonitorState {
        monitor_root: roots.monitor,
        outer_root: roots.outer,
    });

    mmu::write_cr3(state.outer_root);
    mmu::set_cr0_wp();
    log::info!(
        "switched to OuterView (CR3 = {:#x}), CR0.WP set",
        state.outer_root.as_u64()
    );
    Ok(())
}

/// The halt upcall every fatal path in this crate funnels into (spec §6):
/// disable interrupts and spin `hlt` forever. Never returns.
pub fn halt_and_terminate() -> ! {
    log::error!("halt_and_terminate: system is stopping");
    crate::arch::x86_64::halt()
}
