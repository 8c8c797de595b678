//! Stderr sink for the `log` crate. No `env_logger` in the dependency graph:
//! verbosity is fixed at construction rather than read from an environment
//! variable, mirroring the donor's WASM-safe `log!` shim adapted from the
//! browser console to a real stream.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Installs the stderr logger as the global `log` sink. Idempotent: a
/// second call is a no-op rather than a panic.
pub fn install() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
