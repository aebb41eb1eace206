//! Memory barrier abstractions used by the SMP bring-up and barrier code.
//!
//! Centralizes fence operations so call sites (§4.7 cross-CPU barrier, the
//! PCD `set_type`/PTE-update fence of spec §5) read as intent rather than
//! inline asm.

/// Full memory fence (MFENCE semantics) -- all reads and writes issued
/// before this barrier are globally visible before any issued after it.
#[inline(always)]
pub fn memory_fence() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
