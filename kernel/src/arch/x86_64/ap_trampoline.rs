//! Pulls the real-mode AP bootstrap blob (`ap_trampoline.S`) into the
//! kernel image. See that file for the actual bring-up sequence;
//! `smp::trampoline` copies it to its run address and patches it.

core::arch::global_asm!(include_str!("ap_trampoline.S"));
