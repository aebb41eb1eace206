//! Tuning knobs shared across the monitor, the buddy PMM, and SMP bring-up.
//!
//! There is no runtime configuration file -- per spec, the system is a
//! ROM-like boot image with no persisted state -- so "configuration" here
//! means the Cargo feature flags plus this module of `const`s, the same role
//! the teacher gives the constants clustered at the top of
//! `frame_allocator.rs` and `sched/smp.rs`.

/// Bytes per physical page frame.
pub const FRAME_SIZE: usize = 4096;

/// Highest buddy order the PMM serves: a block of order 9 covers
/// `2^9 * 4 KiB` = 2 MiB, matching the largest page size the monitor builds
/// (spec §4.5.1 splits only the first 2 MiB; everything above stays 2 MiB).
pub const MAX_ORDER: usize = 9;

/// Static descriptor pool size for the buddy allocator. The spec requires
/// "an implementation limit (>= 1024)"; this build uses a generous multiple
/// so a 128 MiB test region never exhausts it mid-suite.
pub const BUDDY_DESCRIPTOR_POOL_SIZE: usize = 8192;

/// Upper bound on logical CPUs this build tracks. `CpuSlot` indices above
/// this are refused by SMP bring-up rather than silently dropped.
pub const MAX_CPUS: usize = 16;

/// Physical frame the AP real-mode trampoline is copied to before the
/// STARTUP IPI names it as the AP's entry page (spec §6 reserved regions:
/// `[0x7000, 0x9000)`).
pub const TRAMPOLINE_PHYS_ADDR: u64 = 0x7000;
pub const TRAMPOLINE_PHYS_END: u64 = 0x9000;

/// Size reserved for the BSP boot stack immediately after the kernel image,
/// per spec §6 (`[_kernel_end, _kernel_end + 32 KiB)`).
pub const BSP_STACK_SLACK: u64 = 32 * 1024;

/// Per-AP stack size, carved from the kernel's own BSS rather than the PMM
/// (the PMM is not guaranteed quiescent while APs are still arriving).
pub const AP_STACK_SIZE: usize = 32 * 1024;

/// Bound on the spin loop `wait_delivery` uses to poll the ICR delivery
/// status bit. The original has no calibrated timer this early in boot, so
/// this is an iteration count, not a wall-clock bound (SPEC_FULL.md §C.2).
pub const IPI_DELIVERY_SPIN_LIMIT: u32 = 1_000_000;

/// Iteration counts approximating the SDM's "wait >= 10 ms" / ">= 200 us"
/// AP-startup delays on CPUs with no calibrated timer available yet. These
/// are deliberately generous; a real deployment would calibrate against the
/// PIT or TSC, which this crate's scope excludes (spec Non-goals: no
/// APIC-timer subsystem).
pub const INIT_DEASSERT_DELAY_SPINS: u32 = 1_000_000;
pub const STARTUP_DELAY_SPINS: u32 = 20_000;

/// Bound on the BSP's spin-wait for an AP to publish `CpuSlot::Ready`
/// (spec §4.6 step 2d: "spin-wait -- bounded").
pub const AP_READY_SPIN_LIMIT: u32 = 50_000_000;

/// Bound on the cross-CPU test barrier's busy-wait (spec §4.7).
pub const BARRIER_SPIN_LIMIT: u32 = 50_000_000;

/// Fallback memory region used when multiboot2 supplies neither
/// `BASIC_MEMINFO` nor `MMAP` (spec §6).
pub const FALLBACK_MEM_BASE: u64 = 0x0020_0000;
pub const FALLBACK_MEM_END: u64 = 0x0800_0000;

/// Fixed high-canonical virtual base for the OuterView's read-only
/// diagnostic alias of every protected (`NK_NORMAL`/`NK_PGTABLE`) physical
/// page (spec §4.5.1): `HIGH_ALIAS_BASE + phys` is always present,
/// never writable, in the OuterView only. PML4 index 510, the slot
/// conventionally left for this kind of high-half bookkeeping mapping.
pub const HIGH_ALIAS_BASE: u64 = 0xFFFF_FF00_0000_0000;

/// Local APIC MMIO base is architectural, not board-discovered, on this
/// build (spec §4.3).
pub const LOCAL_APIC_PHYS_BASE: u64 = 0xFEE0_0000;
