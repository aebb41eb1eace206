//! Memory management: the buddy PMM, Page Control Data, the heap, and the
//! page-table types the monitor builds its two views from.

pub mod boot;
pub mod buddy;
pub mod heap;
pub mod page_table;
pub mod pcd;

pub use buddy::{block_size, FrameNumber, PhysicalAddress};

/// Virtual memory address. On this crate's identity-mapped boot path
/// (spec §9) a `VirtualAddress` and a `PhysicalAddress` of the same value
/// name the same byte, but the two types stay distinct so call sites
/// document which space they're reasoning in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }

    pub const fn to_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }
}

impl PhysicalAddress {
    pub const fn to_virt(&self) -> VirtualAddress {
        VirtualAddress::new(self.as_u64())
    }
}

/// Page size options.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB pages.
    Small = 4096,
    /// 2 MiB pages -- the granularity everything above the first 2 MiB of
    /// physical memory stays mapped at (spec §4.5.1).
    Large = 2 * 1024 * 1024,
}

pub use page_table::PageTable;

/// Page flags. Kept as a thin bitset distinct from the `x86_64` crate's own
/// `PageTableFlags` because the monitor's guarded `map_page` reasons about a
/// narrower vocabulary (present/writable/huge) than the full PTE bit layout.
#[derive(Debug, Clone, Copy)]
pub struct PageFlags(u64);

impl PageFlags {
    pub const PRESENT: Self = Self(1 << 0);
    pub const WRITABLE: Self = Self(1 << 1);
    pub const USER: Self = Self(1 << 2);
    pub const WRITE_THROUGH: Self = Self(1 << 3);
    pub const NO_CACHE: Self = Self(1 << 4);
    pub const ACCESSED: Self = Self(1 << 5);
    pub const DIRTY: Self = Self(1 << 6);
    pub const HUGE: Self = Self(1 << 7);
    pub const GLOBAL: Self = Self(1 << 8);
    pub const NO_EXECUTE: Self = Self(1 << 63);

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Outcome of full mm bring-up: where the PCD array landed, the highest
/// usable frame (the monitor's dual-view construction needs this to know
/// how far to map), and the RSDP physical address (if any) for `acpi::init`
/// to continue from.
pub struct MmInit {
    pub pcd_base: PhysicalAddress,
    pub highest_frame: FrameNumber,
    pub rsdp_phys: Option<u64>,
}

/// Two-phase PMM/PCD bring-up (spec §9's cyclic-dependency note), run once
/// from the boot path before the monitor constructs its two views.
///
/// Phase 1 (`mm::boot::parse_and_populate`): populate the buddy allocator
/// from the multiboot2 memory map and carve out the reserved regions
/// (trampoline page, kernel image, boot stack) before anything else touches
/// it. Phase 2: size and allocate the PCD array from the now-populated PMM
/// and stamp every entry `NK_NORMAL` by default (spec §4.1's
/// `init(total_pages)` contract); the monitor re-stamps the frames it hands
/// to the outer kernel as `OK_NORMAL` as those handoffs happen.
pub fn init(multiboot_info_addr: u32) -> Result<MmInit, crate::error::KernelError> {
    log::info!("phase 1: populating buddy allocator from multiboot memory map");
    // The heap must be live before `parse_and_populate` runs:
    // `BuddyAllocator::reserve_region` allocates a `Vec` to collect the
    // free blocks it splits, and the kernel-image/trampoline reservations
    // always intersect a free block.
    heap::init().map_err(|_| crate::error::KernelError::NotInitialized { subsystem: "heap" })?;
    let populated = boot::parse_and_populate(multiboot_info_addr, buddy::pmm())?;
    log::info!("phase 1 complete");

    log::info!("phase 2: sizing and allocating the PCD array");
    let highest_frame = FrameNumber::new(populated.highest_frame);
    let pcd_base = pcd::pcd().init(buddy::pmm(), highest_frame)?;
    log::info!("phase 2 complete: PCD array at {:#x}", pcd_base.as_u64());

    Ok(MmInit {
        pcd_base,
        highest_frame,
        rsdp_phys: populated.rsdp_phys,
    })
}
