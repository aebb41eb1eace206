//! `log` crate facade over the serial console.
//!
//! Boot-stage and invariant-verifier messages go through `log::info!` /
//! `log::warn!` / `log::error!` rather than raw `println!`, the same
//! transition the teacher's own `log_service.rs` represents for its
//! structured circular buffer -- here the sink is just the serial port,
//! since this crate has no VFS or shell to drain a buffer through.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        println!("[{:<5} {}] {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

const fn max_level() -> Level {
    if cfg!(debug_assertions) {
        Level::Trace
    } else {
        Level::Info
    }
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger as the `log` crate's global logger. Must run
/// once, before any subsystem logs; a second call is a programming error
/// elsewhere and is reported rather than silently ignored.
pub fn init() {
    let filter = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    } else {
        println!("[log] logger already installed, ignoring second init()");
    }
}
