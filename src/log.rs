//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//! use fiberun::log::RuntimeLogger;
//!
//! static LOGGER: RuntimeLogger = RuntimeLogger::new();
//! log::set_logger(&LOGGER).unwrap();
//! log::set_max_level(LevelFilter::Info);
//! info!("accept_server_started port={}", 7777);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{Level, Log, Metadata, Record};

/// [`Log`] implementation that writes one structured `key=value` line per
/// record to stderr. Every process using this crate writes a structured log
/// line for each significant state transition (reactor start/stop, accept,
/// connection close, pipeline stage boundaries), per this crate's error
/// handling design.
pub struct RuntimeLogger {
    level: AtomicU32,
}

impl RuntimeLogger {
    /// Creates a logger at the default level ([`Level::Info`]).
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            level: AtomicU32::new(Level::Info as u32),
        }
    }

    /// Creates a logger at an explicit level.
    pub const fn with_level(level: Level) -> Self {
        Self {
            level: AtomicU32::new(level as u32),
        }
    }

    /// Current minimum level this logger will emit.
    pub fn level(&self) -> Level {
        level_from_u32(self.level.load(Ordering::Relaxed))
    }

    /// Changes the minimum level this logger will emit.
    pub fn set_level(&self, level: Level) {
        self.level.store(level as u32, Ordering::Relaxed);
    }
}

impl Default for RuntimeLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn level_from_u32(n: u32) -> Level {
    match n {
        1 => Level::Error,
        2 => Level::Warn,
        3 => Level::Info,
        4 => Level::Debug,
        _ => Level::Trace,
    }
}

impl Log for RuntimeLogger {
    #[inline]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = String::with_capacity(128);
        line.push_str("level=");
        line.push_str(record.level().as_str());
        line.push_str(" target=");
        line.push_str(record.target());
        if let Some(file) = record.file() {
            line.push_str(" file=");
            line.push_str(file);
            if let Some(l) = record.line() {
                line.push(':');
                line.push_str(&l.to_string());
            }
        }
        line.push_str(" msg=\"");
        line.push_str(&record.args().to_string());
        line.push('"');
        line.push('\n');
        // A single `write_all` call keeps concurrent log lines from different
        // OS threads from interleaving mid-line.
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Installs a [`RuntimeLogger`] as the global logger at the given level.
/// Idempotent: returns `Ok(())` even if a logger is already installed by a
/// previous call from this same process (e.g. in tests that initialize more
/// than once).
pub fn init(level: log::LevelFilter) {
    static LOGGER: RuntimeLogger = RuntimeLogger::new();
    LOGGER.set_level(level.to_level().unwrap_or(Level::Error));
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_respects_level() {
        let logger = RuntimeLogger::with_level(Level::Warn);
        assert!(logger.enabled(&Metadata::builder().level(Level::Error).build()));
        assert!(logger.enabled(&Metadata::builder().level(Level::Warn).build()));
        assert!(!logger.enabled(&Metadata::builder().level(Level::Info).build()));
    }

    #[test]
    fn set_level_takes_effect() {
        let logger = RuntimeLogger::new();
        assert_eq!(logger.level(), Level::Info);
        logger.set_level(Level::Debug);
        assert_eq!(logger.level(), Level::Debug);
    }
}
