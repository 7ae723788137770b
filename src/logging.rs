// logging.rs - Explicit logging context handed to the assembler and machine

use log::{Level, LevelFilter};
use std::fmt;

/// Verbosity travels with the component that logs instead of living in a
/// global. Records still go through the `log` facade, so whatever logger
/// the host installed decides where they end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogContext {
    level: LevelFilter,
    target: &'static str,
}

impl Default for LogContext {
    fn default() -> Self {
        LogContext::new(LevelFilter::Warn)
    }
}

impl LogContext {
    pub fn new(level: LevelFilter) -> Self {
        LogContext {
            level,
            target: "h2vm",
        }
    }

    pub fn silent() -> Self {
        LogContext::new(LevelFilter::Off)
    }

    pub fn with_target(mut self, target: &'static str) -> Self {
        self.target = target;
        self
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level && log::log_enabled!(target: self.target, level)
    }

    pub fn log(&self, level: Level, args: fmt::Arguments) {
        if self.enabled(level) {
            log::log!(target: self.target, level, "{}", args);
        }
    }

    pub fn debug(&self, args: fmt::Arguments) {
        self.log(Level::Debug, args);
    }

    pub fn trace(&self, args: fmt::Arguments) {
        self.log(Level::Trace, args);
    }

    pub fn warn(&self, args: fmt::Arguments) {
        self.log(Level::Warn, args);
    }
}
