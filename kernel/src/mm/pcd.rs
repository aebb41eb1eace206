//! Page Control Data: an 8-byte-per-frame type tag classifying every
//! physical page the buddy allocator manages into one of four ownership
//! types. `set_type` only ever touches this array -- reconciling the tag
//! with page-table write permissions is the monitor's job (§4.5).

use core::sync::atomic::{fence, Ordering};

use spin::Once;

use crate::error::KernelError;
use crate::mm::buddy::{FrameNumber, PhysicalAddress};
use crate::sync::IrqSpinlock;

/// Per-frame ownership classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Owned by the outer kernel; writable in both views.
    OkNormal = 0,
    /// Owned by the monitor; the default until explicitly ceded.
    NkNormal = 1,
    /// A page-table page the monitor constructed; self-protecting.
    NkPgTable = 2,
    /// MMIO; tracked but exempt from the OuterView write-strip.
    NkIo = 3,
}

impl PageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::OkNormal),
            1 => Some(Self::NkNormal),
            2 => Some(Self::NkPgTable),
            3 => Some(Self::NkIo),
            _ => None,
        }
    }

    /// Whether a frame of this type must be write-stripped in the
    /// OuterView (property 7).
    pub fn is_outer_protected(self) -> bool {
        matches!(self, Self::NkNormal | Self::NkPgTable)
    }
}

/// One entry per physical frame. 8 bytes, matching the data model exactly
/// so the table's size is `total_pages * 8` with no padding surprises.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PcdEntry {
    ty: u8,
    flags: u8,
    reserved: u16,
    refcount: u32,
}

impl PcdEntry {
    const fn default_entry() -> Self {
        Self {
            ty: PageType::NkNormal as u8,
            flags: 0,
            reserved: 0,
            refcount: 0,
        }
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.ty).unwrap_or(PageType::NkNormal)
    }
}

struct Table {
    /// Backing storage: a slab allocated from the PMM itself once its size
    /// is known (phase 2 of the cyclic PMM/PCD init).
    entries: &'static mut [PcdEntry],
    base_frame: FrameNumber,
}

pub struct Pcd {
    inner: IrqSpinlock<Option<Table>>,
}

impl Pcd {
    const fn new() -> Self {
        Self {
            inner: IrqSpinlock::new(None),
        }
    }

    /// Phase 2 init: claim a block from the buddy allocator sized to cover
    /// every frame from frame 0 through `highest_frame`, stamp every entry
    /// `NK_NORMAL`, then immediately re-stamp the PMM descriptor pool and
    /// the PCD table's own frames (the caller does that via `mark_region`
    /// right after this returns, since this function can't know its own
    /// physical placement until the allocation completes).
    pub fn init(
        &self,
        pmm: &crate::mm::buddy::BuddyAllocator,
        highest_frame: FrameNumber,
    ) -> Result<PhysicalAddress, KernelError> {
        let frame_count = highest_frame.as_u64() as usize + 1;
        let bytes_needed = frame_count * core::mem::size_of::<PcdEntry>();
        let order = order_for_bytes(bytes_needed);

        let base = pmm.alloc(order)?;

        // SAFETY: `base` was just allocated from the PMM as `NK_NORMAL`-only
        // frames (the PMM has no concept of PCD types yet at this point in
        // boot); the monitor restamps these frames NK_NORMAL explicitly
        // right after this call returns, making the aliasing exclusive from
        // here on. The region covers at least `frame_count` entries by
        // construction of `order_for_bytes`.
        let entries: &'static mut [PcdEntry] = unsafe {
            let ptr = base.as_u64() as *mut PcdEntry;
            for i in 0..frame_count {
                ptr.add(i).write(PcdEntry::default_entry());
            }
            core::slice::from_raw_parts_mut(ptr, frame_count)
        };

        *self.inner.lock() = Some(Table {
            entries,
            base_frame: FrameNumber::new(0),
        });

        Ok(base)
    }

    pub fn get_type(&self, addr: PhysicalAddress) -> PageType {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(table) => {
                let idx = (addr.as_frame().as_u64() - table.base_frame.as_u64()) as usize;
                table
                    .entries
                    .get(idx)
                    .map(|e| e.page_type())
                    .unwrap_or(PageType::NkNormal)
            }
            // Until phase 2 completes, every query reports the conservative
            // default.
            None => PageType::NkNormal,
        }
    }

    pub fn set_type(&self, addr: PhysicalAddress, ty: PageType) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let table = guard
            .as_mut()
            .ok_or(KernelError::NotInitialized { subsystem: "pcd" })?;
        let idx = (addr.as_frame().as_u64() - table.base_frame.as_u64()) as usize;
        let entry = table
            .entries
            .get_mut(idx)
            .ok_or(KernelError::UnmanagedAddress { addr: addr.as_u64() })?;
        entry.ty = ty as u8;

        // PCD type changes must be observed by the page-fault handler
        // before any subsequent PTE update reads it back.
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Stamp every page in the half-open window `[base, base+size)`.
    pub fn mark_region(&self, base: PhysicalAddress, size: u64, ty: PageType) -> Result<(), KernelError> {
        let mut addr = base.as_u64();
        let end = addr + size;
        while addr < end {
            self.set_type(PhysicalAddress::new(addr), ty)?;
            addr += crate::config::FRAME_SIZE as u64;
        }
        Ok(())
    }
}

fn order_for_bytes(bytes: usize) -> usize {
    let frames = bytes.div_ceil(crate::config::FRAME_SIZE);
    let mut order = 0;
    while (1usize << order) < frames {
        order += 1;
    }
    order.min(crate::config::MAX_ORDER)
}

// Monitor-private for the same reason as buddy's descriptor pool: `set_type`
// only ever runs pre-switch or under the MonitorView CR3 (§4.5.2), so this
// wrapper must stay out of the outer kernel's writable working set.
#[link_section = ".monitor_private"]
static PCD: Once<Pcd> = Once::new();

pub fn pcd() -> &'static Pcd {
    PCD.call_once(Pcd::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn default_type_before_init_is_nk_normal() {
        assert_eq!(pcd().get_type(PhysicalAddress::new(0)), PageType::NkNormal);
    }
}
