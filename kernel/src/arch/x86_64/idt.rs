//! Interrupt Descriptor Table and fault routing (spec §4.4).
//!
//! Exceptions 0-19 (divide error through SIMD FP exception) all route to the
//! same minimal handler: there is no recovery path for any of them, so the
//! handler's only job is to report the vector and faulting context before
//! calling `halt_and_terminate()`. The page fault (14) gets its own handler
//! because its policy is more specific: a write fault against a page the
//! monitor write-stripped in the OuterView is the expected shape of a
//! protection violation and is reported as such, while every other page
//! fault (no mapping at all) is reported generically. Both are fatal --
//! this crate has no demand paging to recover into.
//!
//! Vector 32 is the Local APIC timer (unused by any subsystem in scope, but
//! EOI'd if it ever fires so the APIC doesn't wedge). Vector 33 is the IPI
//! vector the SMP bring-up and cross-CPU barrier use to nudge a CPU out of
//! a `hlt`. Vector 40 is the spurious-interrupt vector.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::mm::pcd::{pcd, PageType};
use crate::mm::{PhysicalAddress, VirtualAddress};

/// IDT vector for the Local APIC timer.
pub const VECTOR_TIMER: u8 = 32;
/// IDT vector used for inter-processor "wake up and check state" nudges.
pub const VECTOR_IPI: u8 = 33;
/// IDT vector for the Local APIC's spurious interrupt.
pub const VECTOR_SPURIOUS: u8 = 40;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(exception_divide_error);
        idt.debug.set_handler_fn(exception_debug);
        idt.non_maskable_interrupt.set_handler_fn(exception_nmi);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(exception_overflow);
        idt.bound_range_exceeded.set_handler_fn(exception_bound_range);
        idt.invalid_opcode.set_handler_fn(exception_invalid_opcode);
        idt.device_not_available
            .set_handler_fn(exception_device_not_available);
        // SAFETY: the double-fault IST index names a stack gdt::init() set
        // up before idt::init() runs.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::arch::x86_64::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.invalid_tss.set_handler_fn(exception_invalid_tss);
        idt.segment_not_present
            .set_handler_fn(exception_segment_not_present);
        idt.stack_segment_fault
            .set_handler_fn(exception_stack_segment_fault);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point
            .set_handler_fn(exception_x87_floating_point);
        idt.alignment_check.set_handler_fn(exception_alignment_check);
        idt.machine_check.set_handler_fn(exception_machine_check);
        idt.simd_floating_point
            .set_handler_fn(exception_simd_floating_point);
        idt.virtualization.set_handler_fn(exception_virtualization);

        idt[VECTOR_TIMER as usize].set_handler_fn(timer_interrupt_handler);
        idt[VECTOR_IPI as usize].set_handler_fn(ipi_handler);
        idt[VECTOR_SPURIOUS as usize].set_handler_fn(spurious_handler);

        idt
    };
}

pub fn init() {
    IDT.load();
}

/// Common tail for every unrecoverable exception: report what's known, then
/// hand off to the halt/terminate upcall (spec §6's `halt_and_terminate`).
/// Never returns.
fn fatal_exception(name: &str, stack_frame: &InterruptStackFrame) -> ! {
    println!("[IDT] fatal exception: {name}");
    println!("{:#?}", stack_frame);
    crate::monitor::halt_and_terminate();
}

macro_rules! minimal_exception_handler {
    ($fn_name:ident, $name:literal) => {
        extern "x86-interrupt" fn $fn_name(stack_frame: InterruptStackFrame) {
            fatal_exception($name, &stack_frame);
        }
    };
    ($fn_name:ident, $name:literal, $err:ty) => {
        extern "x86-interrupt" fn $fn_name(stack_frame: InterruptStackFrame, error_code: $err) {
            println!("[IDT] error code: {:#x?}", error_code);
            fatal_exception($name, &stack_frame);
        }
    };
}

minimal_exception_handler!(exception_divide_error, "divide error");
minimal_exception_handler!(exception_debug, "debug");
minimal_exception_handler!(exception_nmi, "non-maskable interrupt");
minimal_exception_handler!(exception_overflow, "overflow");
minimal_exception_handler!(exception_bound_range, "bound range exceeded");
minimal_exception_handler!(exception_invalid_opcode, "invalid opcode");
minimal_exception_handler!(exception_device_not_available, "device not available");
minimal_exception_handler!(exception_invalid_tss, "invalid TSS", u64);
minimal_exception_handler!(exception_segment_not_present, "segment not present", u64);
minimal_exception_handler!(exception_stack_segment_fault, "stack segment fault", u64);
minimal_exception_handler!(exception_x87_floating_point, "x87 floating point");
minimal_exception_handler!(exception_alignment_check, "alignment check", u64);
minimal_exception_handler!(exception_machine_check, "machine check");
minimal_exception_handler!(exception_simd_floating_point, "SIMD floating point");
minimal_exception_handler!(exception_virtualization, "virtualization");

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    // The only exception that does NOT terminate: a debugger-inserted INT3
    // is expected to resume. Nothing in this crate sets one deliberately,
    // so this exists purely so `int3` doesn't read as unrecoverable.
    println!("[IDT] breakpoint\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    fatal_exception("double fault", &stack_frame);
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    println!("[IDT] GP fault, error code {:#x}", error_code);
    fatal_exception("general protection fault", &stack_frame);
}

/// Page fault policy (spec §4.4): a write fault against a page PCD marks
/// protected is the monitor's dual-view design doing exactly what it's for
/// -- the outer kernel attempted a write the OuterView doesn't grant. Any
/// other page fault (missing mapping, user/supervisor mismatch, instruction
/// fetch) means something this crate doesn't model happened. Both cases are
/// fatal; the handler does the minimum work needed to say which it was
/// before calling `halt_and_terminate()`.
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    let fault_addr = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    let present = error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);

    if present && write {
        let phys = PhysicalAddress::new(fault_addr);
        let ty = pcd().get_type(phys);
        if ty == PageType::NkNormal || ty == PageType::NkPgTable {
            println!(
                "[IDT] page fault: write to protected page {:#x} (PCD type {:?})",
                fault_addr, ty
            );
            crate::monitor::halt_and_terminate();
        }
    }

    println!(
        "[IDT] page fault at {:#x}, error={:?}",
        fault_addr, error_code
    );
    let _ = VirtualAddress::new(fault_addr);
    fatal_exception("page fault", &stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    crate::arch::x86_64::apic::send_eoi();
}

extern "x86-interrupt" fn ipi_handler(_stack_frame: InterruptStackFrame) {
    crate::arch::x86_64::apic::send_eoi();
}

extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {
    // Per the SDM, the spurious vector must NOT be EOI'd.
}
