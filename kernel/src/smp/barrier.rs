//! Cross-CPU test barrier (spec §4.7): a phase counter the BSP advances and
//! a participant counter every CPU fetch-adds on entry, used by the
//! verification suite to coordinate N CPUs without a scheduler.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::arch::x86_64::mfence;
use crate::config::BARRIER_SPIN_LIMIT;
use crate::error::{KernelError, KernelResult};

pub struct Barrier {
    phase: AtomicU64,
    counter: AtomicUsize,
    participants: usize,
}

impl Barrier {
    pub const fn new(participants: usize) -> Self {
        Self {
            phase: AtomicU64::new(0),
            counter: AtomicUsize::new(0),
            participants,
        }
    }

    /// Called by the BSP to move every waiter on phase `k` past this point.
    pub fn advance_phase(&self) {
        self.phase.fetch_add(1, Ordering::SeqCst);
        mfence();
    }

    /// Fetch-add into the participant counter and spin until it reaches
    /// `self.participants`, then spin until `phase >= target`. Bounded; a
    /// timeout surfaces as a failure rather than a deadlock (spec §4.7).
    pub fn wait(&self, target_phase: u64) -> KernelResult<()> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        mfence();

        let mut spins = 0u32;
        while self.counter.load(Ordering::SeqCst) < self.participants {
            if spins >= BARRIER_SPIN_LIMIT {
                return Err(KernelError::BarrierTimeout { phase: target_phase });
            }
            core::hint::spin_loop();
            spins += 1;
        }

        spins = 0;
        while self.phase.load(Ordering::SeqCst) < target_phase {
            if spins >= BARRIER_SPIN_LIMIT {
                return Err(KernelError::BarrierTimeout { phase: target_phase });
            }
            core::hint::spin_loop();
            spins += 1;
        }
        Ok(())
    }

    pub fn phase(&self) -> u64 {
        self.phase.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn single_participant_barrier_does_not_block() {
        let barrier = Barrier::new(1);
        assert!(barrier.wait(0).is_ok());
    }

    #[test_case]
    fn advancing_phase_is_observable() {
        let barrier = Barrier::new(1);
        assert_eq!(barrier.phase(), 0);
        barrier.advance_phase();
        assert_eq!(barrier.phase(), 1);
    }
}
