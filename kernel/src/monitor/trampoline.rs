//! The monitor-call boundary (spec §4.5.2, §3 `MonitorCall`).
//!
//! A normal function call already saves the caller's callee-saved registers
//! per the Rust/System V ABI; the only privileged state `monitor_call` has
//! to bracket by hand is CR3. So the trampoline is a CR3 save/switch/call/
//! restore around the dispatcher, not a hand-written assembly stub -- the
//! register save the spec describes is the compiler's ordinary function
//! prologue, already happening around the `dispatch` call below.
//!
//! Calls already running on the MonitorView (detected by comparing the
//! live CR3 to the MonitorView root) bypass the CR3 bracket and call
//! `dispatch` directly, per spec §4.5.2's bypass clause.

use crate::arch::x86_64::mmu;
use crate::error::KernelError;
use crate::mm::buddy::PhysicalAddress;
use crate::mm::pcd::{pcd, PageType};
use crate::mm::VirtualAddress;
use crate::monitor::{state, view};

/// One monitor-call operation (spec §3).
#[derive(Debug, Clone, Copy)]
pub enum MonitorCall {
    AllocPhys { order: u8 },
    FreePhys { addr: u64, order: u8 },
    SetPageType { addr: u64, ty: u8 },
    GetPageType { addr: u64 },
    MapPage { phys: u64, virt: u64, writable: bool },
    UnmapPage { virt: u64 },
    AllocPageTable,
}

/// The `{ result: u64, error: i32 }` pair every monitor call returns to its
/// caller (spec §7: "errors are values, not control-flow constructs").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorResult {
    pub result: u64,
    pub error: i32,
}

impl MonitorResult {
    fn ok(result: u64) -> Self {
        Self { result, error: 0 }
    }

    fn err(e: KernelError) -> Self {
        Self {
            result: 0,
            error: e.to_monitor_error(),
        }
    }
}

/// Entry point for every `MonitorCall`. Brackets the call with a CR3
/// switch to the MonitorView unless the caller is already running on it.
pub fn monitor_call(op: MonitorCall) -> MonitorResult {
    let monitor_root = state().monitor_root;
    let caller_cr3 = mmu::read_cr3();

    if caller_cr3 == monitor_root {
        return dispatch(op);
    }

    mmu::write_cr3(monitor_root);
    let result = dispatch(op);
    mmu::write_cr3(caller_cr3);
    result
}

fn dispatch(op: MonitorCall) -> MonitorResult {
    match op {
        MonitorCall::AllocPhys { order } => match crate::mm::buddy::pmm().alloc(order as usize) {
            Ok(addr) => match pcd().set_type(addr, PageType::OkNormal) {
                Ok(()) => MonitorResult::ok(addr.as_u64()),
                Err(e) => MonitorResult::err(e),
            },
            Err(e) => MonitorResult::err(e),
        },
        MonitorCall::FreePhys { addr, order } => {
            let phys = PhysicalAddress::new(addr);
            match pcd().get_type(phys) {
                PageType::OkNormal => {}
                _ => return MonitorResult::err(KernelError::InvalidAddress { addr }),
            }
            match crate::mm::buddy::pmm().free(phys, order as usize) {
                Ok(()) => match pcd().set_type(phys, PageType::NkNormal) {
                    Ok(()) => MonitorResult::ok(0),
                    Err(e) => MonitorResult::err(e),
                },
                Err(e) => MonitorResult::err(e),
            }
        }
        MonitorCall::SetPageType { addr, ty } => match decode_page_type(ty) {
            Some(ty) => match pcd().set_type(PhysicalAddress::new(addr), ty) {
                Ok(()) => MonitorResult::ok(0),
                Err(e) => MonitorResult::err(e),
            },
            None => MonitorResult::err(KernelError::InvalidPageType { value: ty }),
        },
        MonitorCall::GetPageType { addr } => {
            let ty = pcd().get_type(PhysicalAddress::new(addr));
            MonitorResult::ok(ty as u64)
        }
        MonitorCall::MapPage { phys, virt, writable } => {
            let outer_root = state().outer_root;
            match view::map_page(
                outer_root,
                PhysicalAddress::new(phys),
                VirtualAddress::new(virt),
                writable,
            ) {
                Ok(()) => MonitorResult::ok(0),
                Err(e) => MonitorResult::err(e),
            }
        }
        MonitorCall::UnmapPage { virt } => {
            let outer_root = state().outer_root;
            match view::unmap_page(outer_root, VirtualAddress::new(virt)) {
                Ok(()) => MonitorResult::ok(0),
                Err(e) => MonitorResult::err(e),
            }
        }
        MonitorCall::AllocPageTable => match view::alloc_page_table() {
            Ok(addr) => MonitorResult::ok(addr.as_u64()),
            Err(e) => MonitorResult::err(e),
        },
    }
}

fn decode_page_type(v: u8) -> Option<PageType> {
    match v {
        0 => Some(PageType::OkNormal),
        1 => Some(PageType::NkNormal),
        2 => Some(PageType::NkPgTable),
        3 => Some(PageType::NkIo),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn unknown_page_type_byte_is_rejected() {
        assert_eq!(decode_page_type(4), None);
        assert_eq!(decode_page_type(0), Some(PageType::OkNormal));
    }
}
