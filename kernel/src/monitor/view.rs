//! Dual page-table view construction (spec §4.5.1).
//!
//! Builds two complete 4-level hierarchies over the same physical memory: a
//! MonitorView where every page is writable, and an OuterView where every
//! `NK_NORMAL`/`NK_PGTABLE` frame has its writable bit stripped. The two
//! roots start out structurally identical -- same layout, same leaf
//! addresses -- and diverge only in the writable bit, which is exactly
//! what property 3 (translation agreement outside the protected set) and
//! property 7 (write-strip coverage) ask for.
//!
//! The first 2 MiB of physical memory is split into 4 KiB pages (so boot-time
//! objects like the kernel image and the AP trampoline page get individual
//! protection); everything above stays mapped as 2 MiB pages. A 2 MiB window
//! that contains even one protected frame is conservatively write-stripped
//! in its entirety in the OuterView -- coarser than strictly necessary, but
//! this build never splits memory above 2 MiB (spec §4.5.1 Non-goals), so a
//! mixed window has no finer fallback.

use crate::config::{FRAME_SIZE, HIGH_ALIAS_BASE, LOCAL_APIC_PHYS_BASE};
use crate::error::{KernelError, KernelResult};
use crate::mm::buddy::{pmm, FrameNumber, PhysicalAddress};
use crate::mm::page_table::{PageTable, PageTableIndex, VirtualAddressBreakdown, PAGE_TABLE_ENTRIES};
use crate::mm::pcd::{pcd, PageType};
use crate::mm::{PageFlags, VirtualAddress};

const TWO_MIB: u64 = 2 * 1024 * 1024;

/// The two page-table roots the monitor hands to `trampoline`/`verify` once
/// construction completes.
pub struct ViewRoots {
    pub monitor: PhysicalAddress,
    pub outer: PhysicalAddress,
}

/// Allocate a fresh page-table page from the PMM, zero it, and stamp it
/// `NK_PGTABLE` -- every page-table page this monitor ever builds is
/// self-protecting from the moment it exists (spec §4.5.3).
pub fn alloc_page_table() -> KernelResult<PhysicalAddress> {
    let phys = pmm().alloc(0)?;
    // SAFETY: `phys` is a freshly allocated, exclusively-owned order-0 frame;
    // writing a zeroed `PageTable` to it is the only access before any PTE
    // is installed.
    unsafe {
        let ptr = phys.as_u64() as *mut PageTable;
        ptr.write(PageTable::new());
    }
    pcd().set_type(phys, PageType::NkPgTable)?;
    Ok(phys)
}

pub(crate) fn table_at(phys: PhysicalAddress) -> &'static mut PageTable {
    // SAFETY: `phys` always names a page this module allocated via
    // `alloc_page_table`; it is identity-mapped and exclusively reachable
    // through the monitor's own view-construction/mutation code paths.
    unsafe { &mut *(phys.as_u64() as *mut PageTable) }
}

/// Writable bit for an entry pointing at a child page-table page. Every
/// page-table page is `NK_PGTABLE`, so this is just property 1/5's
/// "writable from Monitor, read-only from Outer" rule applied once.
fn intermediate_flags(outer: bool) -> PageFlags {
    let base = PageFlags::PRESENT;
    if outer {
        base
    } else {
        base | PageFlags::WRITABLE
    }
}

/// Writable bit for a leaf entry mapping an ordinary physical frame,
/// decided by that frame's current PCD type (spec §4.5.1 / property 7).
fn leaf_flags_for(phys: PhysicalAddress, outer: bool) -> PageFlags {
    let writable = match pcd().get_type(phys) {
        PageType::OkNormal | PageType::NkIo => true,
        PageType::NkNormal | PageType::NkPgTable => !outer,
    };
    let mut flags = PageFlags::PRESENT | PageFlags::GLOBAL;
    if writable {
        flags = flags | PageFlags::WRITABLE;
    }
    flags
}

/// Writable bit for a 2 MiB leaf: conservatively non-writable in the
/// OuterView if any of the 512 frames it covers is outer-protected.
fn leaf_flags_for_2mib(window_base: u64, outer: bool) -> PageFlags {
    let mut any_protected = false;
    for i in 0..PAGE_TABLE_ENTRIES as u64 {
        let addr = PhysicalAddress::new(window_base + i * FRAME_SIZE as u64);
        if pcd().get_type(addr).is_outer_protected() {
            any_protected = true;
            break;
        }
    }
    let mut flags = PageFlags::PRESENT | PageFlags::GLOBAL | PageFlags::HUGE;
    if !outer || !any_protected {
        flags = flags | PageFlags::WRITABLE;
    }
    flags
}

/// Fetch the child table `index` points to, creating it with
/// `intermediate_flags(outer)` if absent. Errors if the entry is already a
/// present 2 MiB leaf -- this hierarchy never splits an existing huge page.
fn child_or_create(
    parent: PhysicalAddress,
    index: PageTableIndex,
    outer: bool,
    virt_hint: u64,
) -> KernelResult<PhysicalAddress> {
    let table = table_at(parent);
    if table[index].is_present() {
        if table[index].flags().contains(PageFlags::HUGE) {
            return Err(KernelError::AlreadyMapped { virt: virt_hint });
        }
        return Ok(table[index].addr().expect("present entry has a frame"));
    }
    let child = alloc_page_table()?;
    table[index].set(child.as_frame(), intermediate_flags(outer));
    Ok(child)
}

/// Map one 2 MiB-aligned window of physical memory into `pml4`, splitting
/// into 4 KiB pages if the window is `[0, 2 MiB)`.
fn map_2mib_window(pml4: PhysicalAddress, window_base: u64, outer: bool) -> KernelResult<()> {
    let l4_index = PageTableIndex::new_truncate((window_base >> 39) as u16);
    let l3_index = PageTableIndex::new_truncate((window_base >> 30) as u16);
    let l2_index = PageTableIndex::new_truncate((window_base >> 21) as u16);

    let pdpt = child_or_create(pml4, l4_index, outer, window_base)?;
    let pd = child_or_create(pdpt, l3_index, outer, window_base)?;

    let pd_table = table_at(pd);
    if pd_table[l2_index].is_present() {
        // Already built by an earlier call (the APIC window can fall inside
        // an already-mapped RAM extent on small test configurations).
        return Ok(());
    }

    if window_base < TWO_MIB {
        let pt = alloc_page_table()?;
        pd_table[l2_index].set(pt.as_frame(), intermediate_flags(outer));
        let pt_table = table_at(pt);
        for i in 0..PAGE_TABLE_ENTRIES {
            let frame_phys = PhysicalAddress::new(window_base + (i as u64) * FRAME_SIZE as u64);
            pt_table[i].set(frame_phys.as_frame(), leaf_flags_for(frame_phys, outer));
        }
    } else {
        let flags = leaf_flags_for_2mib(window_base, outer);
        pd_table[l2_index].set(FrameNumber::new(window_base / FRAME_SIZE as u64), flags);
    }
    Ok(())
}

/// Map the Local APIC MMIO frame as `NK_IO`: present and writable in both
/// views regardless of `outer`, bypassing the PCD scan entirely since the
/// APIC's physical address sits far outside the PCD array's managed range
/// (`[0, highest_frame]`) and is never itself a PMM-allocatable frame.
fn map_apic_window(pml4: PhysicalAddress, apic_phys: u64, outer: bool) -> KernelResult<()> {
    let window_base = apic_phys & !(TWO_MIB - 1);
    let l4_index = PageTableIndex::new_truncate((window_base >> 39) as u16);
    let l3_index = PageTableIndex::new_truncate((window_base >> 30) as u16);
    let l2_index = PageTableIndex::new_truncate((window_base >> 21) as u16);

    let pdpt = child_or_create(pml4, l4_index, outer, window_base)?;
    let pd = child_or_create(pdpt, l3_index, outer, window_base)?;
    let pd_table = table_at(pd);
    if pd_table[l2_index].is_present() {
        return Ok(());
    }
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL | PageFlags::HUGE;
    pd_table[l2_index].set(FrameNumber::new(window_base / FRAME_SIZE as u64), flags);
    Ok(())
}

/// Build one complete view root: identity-mapped RAM from `0` through
/// `highest_frame`, plus the Local APIC MMIO window.
fn build_root(outer: bool, highest_frame: FrameNumber, apic_phys: u64) -> KernelResult<PhysicalAddress> {
    let pml4 = alloc_page_table()?;
    let last_byte = (highest_frame.as_u64() + 1) * FRAME_SIZE as u64;

    let mut addr = 0u64;
    while addr < last_byte {
        map_2mib_window(pml4, addr, outer)?;
        addr += TWO_MIB;
    }

    map_apic_window(pml4, apic_phys, outer)?;
    Ok(pml4)
}

/// Insert one 4 KiB leaf into `root` at `virt` -> `phys`, allocating any
/// missing intermediate tables along the way as `NK_PGTABLE`, non-writable
/// from the outer side (this always targets the OuterView hierarchy; the
/// MonitorView never needs a second mapping of memory it already has full
/// identity access to).
fn insert_leaf(root: PhysicalAddress, virt: VirtualAddress, phys: PhysicalAddress, writable: bool) -> KernelResult<()> {
    let bd = VirtualAddressBreakdown::new(virt);
    let pdpt = child_or_create(root, bd.l4_index, true, virt.as_u64())?;
    let pd = child_or_create(pdpt, bd.l3_index, true, virt.as_u64())?;
    let pt = child_or_create(pd, bd.l2_index, true, virt.as_u64())?;

    let pt_table = table_at(pt);
    if pt_table[bd.l1_index].is_present() {
        return Err(KernelError::AlreadyMapped { virt: virt.as_u64() });
    }
    let mut flags = PageFlags::PRESENT | PageFlags::GLOBAL;
    if writable {
        flags = flags | PageFlags::WRITABLE;
    }
    pt_table[bd.l1_index].set(phys.as_frame(), flags);
    crate::arch::x86_64::mmu::invlpg(virt);
    Ok(())
}

/// The guarded mapping primitive (spec §4.5.3): rejects a writable request
/// against a protected frame outright, otherwise inserts the translation
/// into the OuterView hierarchy with write permission following the
/// frame's current PCD type.
pub fn map_page(outer_root: PhysicalAddress, phys: PhysicalAddress, virt: VirtualAddress, want_writable: bool) -> KernelResult<()> {
    let writable = match pcd().get_type(phys) {
        PageType::OkNormal | PageType::NkIo => want_writable,
        PageType::NkNormal | PageType::NkPgTable => {
            if want_writable {
                return Err(KernelError::MappingRejected {
                    phys: phys.as_u64(),
                    virt: virt.as_u64(),
                });
            }
            false
        }
    };
    insert_leaf(outer_root, virt, phys, writable)
}

/// Look up the child table `index` points to without creating one.
pub(crate) fn find_child(parent: PhysicalAddress, index: PageTableIndex) -> Option<PhysicalAddress> {
    let table = table_at(parent);
    if table[index].is_present() && !table[index].flags().contains(PageFlags::HUGE) {
        table[index].addr()
    } else {
        None
    }
}

/// Remove the OuterView's translation for `virt`, if present. Never
/// creates missing intermediate tables -- an absent path is simply "not
/// mapped".
pub fn unmap_page(outer_root: PhysicalAddress, virt: VirtualAddress) -> KernelResult<()> {
    let bd = VirtualAddressBreakdown::new(virt);
    let not_mapped = KernelError::InvalidAddress { addr: virt.as_u64() };

    let pdpt = find_child(outer_root, bd.l4_index).ok_or(not_mapped)?;
    let pd = find_child(pdpt, bd.l3_index).ok_or(not_mapped)?;
    let pt = find_child(pd, bd.l2_index).ok_or(not_mapped)?;

    let pt_table = table_at(pt);
    if !pt_table[bd.l1_index].is_present() {
        return Err(not_mapped);
    }
    pt_table[bd.l1_index].clear();
    crate::arch::x86_64::mmu::invlpg(virt);
    Ok(())
}

/// Install the high-canonical read-only alias of every currently protected
/// frame (spec §4.5.1 last paragraph): lets the outer kernel inspect
/// monitor-owned memory for diagnostics without ever being able to write
/// it. Runs once, after the OuterView's main identity range is built, so
/// it sees every frame the boot-time reservations stamped `NK_NORMAL`/
/// `NK_PGTABLE`.
fn build_high_alias(outer_root: PhysicalAddress, highest_frame: FrameNumber) -> KernelResult<()> {
    let mut frame = 0u64;
    while frame <= highest_frame.as_u64() {
        let phys = FrameNumber::new(frame).as_addr();
        if pcd().get_type(phys).is_outer_protected() {
            let virt = VirtualAddress::new(HIGH_ALIAS_BASE + phys.as_u64());
            match insert_leaf(outer_root, virt, phys, false) {
                Ok(()) | Err(KernelError::AlreadyMapped { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        frame += 1;
    }
    Ok(())
}

/// Build both views over physical memory `[0, highest_frame]` plus the
/// Local APIC window, then install the OuterView's read-only high alias.
pub fn construct(highest_frame: FrameNumber) -> KernelResult<ViewRoots> {
    let monitor = build_root(false, highest_frame, LOCAL_APIC_PHYS_BASE)?;
    let outer = build_root(true, highest_frame, LOCAL_APIC_PHYS_BASE)?;
    build_high_alias(outer, highest_frame)?;
    Ok(ViewRoots { monitor, outer })
}
