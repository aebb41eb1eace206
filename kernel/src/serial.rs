//! COM1 serial console. The only console this monitor has -- there is no
//! VGA buffer in the target environment, and the monitor's own boot-stage
//! markers and verifier report must survive even when the outer kernel
//! above it has not yet brought up anything else.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort as Uart;
use x86_64::instructions::interrupts;

const COM1: u16 = 0x3F8;

lazy_static! {
    pub static ref SERIAL1: Mutex<Uart> = {
        let mut port = unsafe { Uart::new(COM1) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial port write failed");
    });
}
