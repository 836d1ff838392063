//! Kernel logger
//!
//! Implements the `log` facade over the serial console. Installed once by
//! the BSP during early boot; until then (and on the host) the `log` macros
//! are no-ops. The level filter can be changed at runtime.

use log::{LevelFilter, Log, Metadata, Record};

use crate::error::{KernelError, KernelResult};
use crate::serial;

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial::write_fmt(format_args!(
            "[{:5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the kernel logger with the given level filter. Fails if a logger
/// was installed already.
pub fn init(level: LevelFilter) -> KernelResult<()> {
    serial::init();
    log::set_logger(&LOGGER).map_err(|_| KernelError::InvalidState {
        expected: "no logger installed",
        actual: "logger already installed",
    })?;
    log::set_max_level(level);
    Ok(())
}

/// Adjust the level filter of the installed logger
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
