//! Error types for the monitor, PMM, SMP, and APIC/ACPI code.
//!
//! Styled after the teacher's `error.rs`: a `#[must_use]` enum, a `Display`
//! impl instead of string literals scattered through the call sites, and a
//! `KernelResult<T>` alias. Cut down to the families this crate actually
//! raises -- no capability/IPC/scheduler/syscall/filesystem variants, since
//! none of those subsystems exist here.

use core::fmt;

/// Result alias used throughout the crate.
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error type.
///
/// Per spec §7, this is how failures are represented *inside* the crate
/// (the PMM, PCD, monitor dispatcher, APIC/ACPI code). It never crosses the
/// `monitor_call` boundary directly -- the trampoline collapses any `Err`
/// into `{ result: 0, error: -1 }` (spec §7: "errors are values, not
/// control-flow constructs").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The buddy allocator has no free block of the requested order.
    OutOfMemory { order: u8 },
    /// The buddy allocator's static descriptor pool is exhausted -- distinct
    /// from ordinary out-of-memory per spec §4.2.
    DescriptorPoolExhausted,
    /// An address is malformed (not page-aligned where alignment is
    /// required, or otherwise not a value this operation accepts).
    InvalidAddress { addr: u64 },
    /// A PCD type tag byte did not decode to a known `PageType`.
    InvalidPageType { value: u8 },
    /// An address falls outside any range the PCD/PMM manages.
    UnmanagedAddress { addr: u64 },
    /// `map_page` rejected a write-permission request against a protected
    /// PCD type (spec §4.5.3 / testable property 6).
    MappingRejected { phys: u64, virt: u64 },
    /// `map_page` was asked to insert a translation where one already
    /// exists.
    AlreadyMapped { virt: u64 },
    /// A hardware resource the caller expected is already present
    /// (re-initialization, duplicate registration).
    AlreadyExists { resource: &'static str, id: u64 },
    /// An argument failed validation.
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    /// A generic resource (reserved-region table, CPU slot table, ...) has
    /// no room left.
    ResourceExhausted { resource: &'static str },
    /// An APIC IPI (INIT, STARTUP, or ordinary) did not report delivery
    /// within the bounded spin (spec §4.3 `wait_delivery`).
    ApicTimeout { apic_id: u32, stage: &'static str },
    /// The cross-CPU test barrier did not reach its target within the
    /// bounded spin (spec §4.7).
    BarrierTimeout { phase: u64 },
    /// A subsystem was queried before its `init` completed.
    NotInitialized { subsystem: &'static str },
    /// A state-machine transition was attempted out of order (e.g. a
    /// `CpuSlot` regressing, or being asked to regress).
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { order } => {
                write!(f, "out of memory: no free block of order {order}")
            }
            Self::DescriptorPoolExhausted => write!(f, "buddy descriptor pool exhausted"),
            Self::InvalidAddress { addr } => write!(f, "invalid address {addr:#x}"),
            Self::InvalidPageType { value } => write!(f, "invalid PCD page type byte {value}"),
            Self::UnmanagedAddress { addr } => write!(f, "address {addr:#x} is not PMM-managed"),
            Self::MappingRejected { phys, virt } => write!(
                f,
                "mapping rejected: phys {phys:#x} -> virt {virt:#x} would grant a protected write"
            ),
            Self::AlreadyMapped { virt } => write!(f, "virt {virt:#x} is already mapped"),
            Self::AlreadyExists { resource, id } => {
                write!(f, "{resource} #{id} already exists")
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument {name}: {value}")
            }
            Self::ResourceExhausted { resource } => write!(f, "{resource} exhausted"),
            Self::ApicTimeout { apic_id, stage } => {
                write!(f, "APIC {apic_id}: timeout during {stage}")
            }
            Self::BarrierTimeout { phase } => write!(f, "test barrier timed out at phase {phase}"),
            Self::NotInitialized { subsystem } => write!(f, "{subsystem} is not initialized"),
            Self::InvalidState { expected, actual } => {
                write!(f, "expected state {expected}, found {actual}")
            }
        }
    }
}

impl KernelError {
    /// Collapse to the `{ result: u64, error: i32 }` pair `monitor_call`
    /// returns to the outer kernel (spec §3 `MonitorCall`, §7). Every
    /// rejection is `-1`; the dispatcher never distinguishes error kinds at
    /// this boundary, mirroring the reference's flat `error = -1`.
    pub const fn to_monitor_error(self) -> i32 {
        -1
    }
}
