//! Boot-time invariant verification (spec §4.5.4).
//!
//! Runs after a CPU has switched onto the OuterView. Each invariant is
//! independent and cheap enough to run on every CPU at boot; `run()` prints
//! one summary line and returns whether every invariant held.
//!
//! Invariant 3 ("MonitorView and OuterView agree on all non-protected
//! translations") is checked by translation equivalence rather than raw PML4
//! entry equality: this build's two views are fully independent page-table
//! hierarchies (see `view`'s module doc), so corresponding PML4 entries
//! never point at the same physical table even where nothing is protected.
//! What has to hold, and what this checks, is that for every 2 MiB window
//! that contains no outer-protected frame, both views resolve its base
//! address to the same physical frame with the same writable bit.

use crate::mm::page_table::{PageTableEntry, VirtualAddressBreakdown};
use crate::mm::pcd::pcd;
use crate::mm::{PageFlags, PhysicalAddress, VirtualAddress};
use crate::monitor::state;
use crate::monitor::view::{find_child, table_at};

const TWO_MIB: u64 = 2 * 1024 * 1024;

/// Outcome of a single invariant check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvariantResult {
    pub number: u8,
    pub name: &'static str,
    pub pass: bool,
}

/// Resolve `virt` through `root` down to its leaf entry: a 4 KiB PTE, or the
/// 2 MiB PDE itself if the translation stops at a huge page. Returns `None`
/// if any level along the path is absent.
fn walk_leaf(root: PhysicalAddress, virt: VirtualAddress) -> Option<PageTableEntry> {
    let bd = VirtualAddressBreakdown::new(virt);
    let pdpt = find_child(root, bd.l4_index)?;
    let pd = find_child(pdpt, bd.l3_index)?;
    let pd_table = table_at(pd);
    let pd_entry = pd_table[bd.l2_index];
    if !pd_entry.is_present() {
        return None;
    }
    if pd_entry.flags().contains(PageFlags::HUGE) {
        return Some(pd_entry);
    }
    let pt = pd_entry.addr()?;
    let pt_table = table_at(pt);
    let pte = pt_table[bd.l1_index];
    if pte.is_present() {
        Some(pte)
    } else {
        None
    }
}

/// Invariant 1: in the OuterView, every page-table page is mapped
/// non-writable. Every `NK_PGTABLE` frame is subject to the same write-strip
/// rule as any other protected frame, so checking the monitor's own root
/// (itself an `NK_PGTABLE` page, stamped by `view::alloc_page_table`) is
/// representative of the whole set.
fn check_outer_ptp_readonly() -> bool {
    let rep = state().monitor_root;
    match walk_leaf(state().outer_root, VirtualAddress::new(rep.as_u64())) {
        Some(pte) => !pte.flags().contains(PageFlags::WRITABLE),
        None => false,
    }
}

/// Invariant 2: CR0.WP is set whenever the OuterView is the live CR3.
fn check_cr0_wp() -> bool {
    let cr3_is_outer = crate::arch::x86_64::mmu::read_cr3() == state().outer_root;
    let wp_set = crate::arch::x86_64::mmu::read_cr0() & (1 << 16) != 0;
    !cr3_is_outer || wp_set
}

/// Invariant 3: translation agreement outside the protected set (see module
/// doc for why this is windows-of-agreement rather than raw entry equality).
fn check_translation_agreement(highest_frame: u64) -> bool {
    let last_byte = (highest_frame + 1) * 4096;
    let mut window = 0u64;
    while window < last_byte {
        if !any_protected_in_window(window) {
            let virt = VirtualAddress::new(window);
            let m = walk_leaf(state().monitor_root, virt);
            let o = walk_leaf(state().outer_root, virt);
            match (m, o) {
                (Some(m_pte), Some(o_pte)) => {
                    let same_frame = m_pte.addr() == o_pte.addr();
                    let both_writable = m_pte.flags().contains(PageFlags::WRITABLE)
                        && o_pte.flags().contains(PageFlags::WRITABLE);
                    if !same_frame || !both_writable {
                        return false;
                    }
                }
                (None, None) => {}
                _ => return false,
            }
        }
        window += TWO_MIB;
    }
    true
}

fn any_protected_in_window(window_base: u64) -> bool {
    let mut i = 0u64;
    while i < 512 {
        let addr = PhysicalAddress::new(window_base + i * 4096);
        if pcd().get_type(addr).is_outer_protected() {
            return true;
        }
        i += 1;
    }
    false
}

/// Invariant 4: the trampoline's two roots both exist (non-zero).
fn check_roots_exist() -> bool {
    state().monitor_root.as_u64() != 0 && state().outer_root.as_u64() != 0
}

/// Invariant 5: in the MonitorView, every page-table page is writable.
fn check_monitor_ptp_writable() -> bool {
    let rep = state().monitor_root;
    match walk_leaf(state().monitor_root, VirtualAddress::new(rep.as_u64())) {
        Some(pte) => pte.flags().contains(PageFlags::WRITABLE),
        None => false,
    }
}

/// Invariant 6: CR3 only ever holds one of the two pre-declared roots.
fn check_cr3_is_one_of_two_roots() -> bool {
    let cr3 = crate::arch::x86_64::mmu::read_cr3();
    cr3 == state().monitor_root || cr3 == state().outer_root
}

/// Run all six invariants and print one summary line plus, if `verbose`, a
/// per-invariant detail line (spec §4.5.4's closing sentence).
pub fn run(highest_frame: u64, verbose: bool) -> bool {
    let results = [
        InvariantResult {
            number: 1,
            name: "outer PTPs read-only",
            pass: check_outer_ptp_readonly(),
        },
        InvariantResult {
            number: 2,
            name: "CR0.WP set under OuterView",
            pass: check_cr0_wp(),
        },
        InvariantResult {
            number: 3,
            name: "translation agreement",
            pass: check_translation_agreement(highest_frame),
        },
        InvariantResult {
            number: 4,
            name: "trampoline roots exist",
            pass: check_roots_exist(),
        },
        InvariantResult {
            number: 5,
            name: "monitor PTPs writable",
            pass: check_monitor_ptp_writable(),
        },
        InvariantResult {
            number: 6,
            name: "CR3 is one of two roots",
            pass: check_cr3_is_one_of_two_roots(),
        },
    ];

    let all_pass = results.iter().all(|r| r.pass);
    if verbose {
        for r in &results {
            if r.pass {
                log::info!("invariant {}: {} ... PASS", r.number, r.name);
            } else {
                log::error!("invariant {}: {} ... FAIL", r.number, r.name);
            }
        }
    }
    let held = results.iter().filter(|r| r.pass).count();
    if all_pass {
        log::info!("summary: {held}/{} invariants held", results.len());
    } else {
        log::error!("summary: {held}/{} invariants held", results.len());
    }
    all_pass
}

