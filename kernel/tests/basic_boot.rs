//! Smoke test: the image boots far enough to reach a `_start` that can run
//! assertions and report over serial, independent of the full
//! `kernel_main` boot sequence in `src/main.rs`.

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use nk_monitor::serial_println;
use nk_monitor::test_framework::{exit_qemu, test_panic_handler, QemuExitCode};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    serial_println!("Starting basic boot tests...");

    test_println();
    test_simple_assertion();
    test_kernel_alive();

    serial_println!("All tests passed!");
    exit_qemu(QemuExitCode::Success)
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test_panic_handler(info)
}

fn test_println() {
    serial_println!("test_println output");
}

fn test_simple_assertion() {
    let x = 2 + 2;
    assert_eq!(x, 4);
}

fn test_kernel_alive() {
    // If we get here, the kernel booted successfully
    serial_println!("Kernel is alive and running tests!");
}
