//! Per-CPU bookkeeping (spec §4.6): a fixed table of `CpuSlot`s, one per
//! logical CPU, each driven forward-only through `Offline -> Booting ->
//! Online -> Ready`.
//!
//! Styled after the teacher's `sched::smp::CpuInfo` -- atomics for every
//! field accessed from more than one CPU, `Ordering::Acquire`/`Release` on
//! the publish/consume side of a state change -- but the state here is a
//! four-value enum instead of a handful of independent bools, since the
//! spec's bring-up sequence is a strict state machine, not independent
//! online/idle flags.

use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::config::MAX_CPUS;
use crate::error::{KernelError, KernelResult};
use crate::sync::IrqSpinlock;

const UNASSIGNED: u32 = u32::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuState {
    Offline = 0,
    Booting = 1,
    Online = 2,
    Ready = 3,
}

impl CpuState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CpuState::Offline,
            1 => CpuState::Booting,
            2 => CpuState::Online,
            _ => CpuState::Ready,
        }
    }
}

pub struct CpuSlot {
    apic_id: AtomicU32,
    /// The AP's own fetch-added logical index (spec §4.6 step 3), distinct
    /// from this slot's fixed position in `SLOTS`.
    index: AtomicUsize,
    state: AtomicU8,
}

impl CpuSlot {
    const fn empty() -> Self {
        Self {
            apic_id: AtomicU32::new(UNASSIGNED),
            index: AtomicUsize::new(usize::MAX),
            state: AtomicU8::new(CpuState::Offline as u8),
        }
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Acquire)
    }

    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, idx: usize) {
        self.index.store(idx, Ordering::Release);
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance to `next`, refusing anything but the single permitted forward
    /// step (spec §4.6: "Only forward").
    pub fn advance(&self, next: CpuState) -> KernelResult<()> {
        let current = self.state();
        let allowed = matches!(
            (current, next),
            (CpuState::Offline, CpuState::Booting)
                | (CpuState::Booting, CpuState::Online)
                | (CpuState::Online, CpuState::Ready)
        );
        if !allowed {
            return Err(KernelError::InvalidState {
                expected: "the next state in Offline->Booting->Online->Ready",
                actual: "out-of-order transition",
            });
        }
        self.state.store(next as u8, Ordering::Release);
        crate::arch::x86_64::mfence();
        if next == CpuState::Ready {
            *ready_count().lock() += 1;
        }
        Ok(())
    }

    /// The BSP is never `Offline` in this process's lifetime -- it reaches
    /// `Ready` by definition (it finished its own boot sequence before
    /// anything else runs), so it is stamped directly rather than walked
    /// through the AP transitions.
    fn force_ready(&self) {
        self.state.store(CpuState::Ready as u8, Ordering::Release);
        crate::arch::x86_64::mfence();
        *ready_count().lock() += 1;
    }
}

const EMPTY_SLOT: CpuSlot = CpuSlot::empty();
static SLOTS: [CpuSlot; MAX_CPUS] = [EMPTY_SLOT; MAX_CPUS];
// Index 0 is reserved for the BSP (`register_bsp` stores it directly), so
// the AP counter starts at 1 -- otherwise the first AP's `claim_index()`
// would collide with the BSP's index.
static NEXT_INDEX: AtomicUsize = AtomicUsize::new(1);

static READY_COUNT: IrqSpinlock<usize> = IrqSpinlock::new(0);

fn ready_count() -> &'static IrqSpinlock<usize> {
    &READY_COUNT
}

pub fn ready_count_value() -> usize {
    *READY_COUNT.lock()
}

/// Register a table slot for `apic_id`, called once per CPU by the BSP
/// before it starts that CPU (or, for the BSP's own entry, once at the very
/// start of bring-up). CAS-claims the first unassigned slot.
pub fn register(apic_id: u32) -> KernelResult<&'static CpuSlot> {
    for slot in SLOTS.iter() {
        if slot
            .apic_id
            .compare_exchange(UNASSIGNED, apic_id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(slot);
        }
    }
    Err(KernelError::ResourceExhausted {
        resource: "CpuSlot table",
    })
}

/// Register the BSP's own slot and mark it `Ready` immediately.
pub fn register_bsp(apic_id: u32) -> KernelResult<&'static CpuSlot> {
    let slot = register(apic_id)?;
    slot.index.store(0, Ordering::Release);
    slot.force_ready();
    Ok(slot)
}

/// Find the slot the BSP already registered for `apic_id` (called by the AP
/// itself once it is running, to avoid allocating a second slot for the same
/// CPU).
pub fn lookup(apic_id: u32) -> Option<&'static CpuSlot> {
    SLOTS.iter().find(|slot| slot.apic_id() == apic_id)
}

/// The AP's own fetch-add of the next-CPU-index counter (spec §4.6 step 3).
pub fn claim_index() -> usize {
    NEXT_INDEX.fetch_add(1, Ordering::SeqCst)
}

pub fn slots() -> &'static [CpuSlot; MAX_CPUS] {
    &SLOTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn forward_transitions_are_accepted_in_order() {
        let slot = CpuSlot::empty();
        assert_eq!(slot.state(), CpuState::Offline);
        assert!(slot.advance(CpuState::Booting).is_ok());
        assert!(slot.advance(CpuState::Online).is_ok());
        assert!(slot.advance(CpuState::Ready).is_ok());
    }

    #[test_case]
    fn backward_or_skipped_transitions_are_rejected() {
        let slot = CpuSlot::empty();
        assert!(slot.advance(CpuState::Online).is_err());
        assert!(slot.advance(CpuState::Booting).is_ok());
        assert!(slot.advance(CpuState::Booting).is_err());
        assert!(slot.advance(CpuState::Ready).is_err());
    }
}
