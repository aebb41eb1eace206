//! Symmetric multiprocessing: the BSP/AP bring-up state machine (spec §4.6)
//! and the cross-CPU test barrier (spec §4.7).

pub mod barrier;
pub mod bringup;
pub mod cpu;
pub mod trampoline;

pub use cpu::CpuState;
