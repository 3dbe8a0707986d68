//! Pluggable logging for the server runtime.
//!
//! The runtime takes an `Arc<dyn Logger + Send + Sync>` and logs through
//! the [`trace!`], [`debug!`] and [`error!`] macros, which check the
//! configured level before formatting anything.

use std::sync::Arc;

#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
pub enum LogLevel {
    Off,
    Error,
    Info,
    Debug,
    Trace,
}

pub trait Logger {
    fn level(&self) -> LogLevel;
    fn error(&self, msg: &str);
    fn info(&self, msg: &str);
    fn debug(&self, msg: &str);
    fn trace(&self, msg: &str);
}

impl<T: Logger + ?Sized> Logger for Arc<T> {
    fn level(&self) -> LogLevel {
        self.as_ref().level()
    }

    fn error(&self, msg: &str) {
        self.as_ref().error(msg);
    }

    fn info(&self, msg: &str) {
        self.as_ref().info(msg);
    }

    fn debug(&self, msg: &str) {
        self.as_ref().debug(msg);
    }

    fn trace(&self, msg: &str) {
        self.as_ref().trace(msg);
    }
}

/// Discards everything.
pub struct NullLogger;

impl Logger for NullLogger {
    fn level(&self) -> LogLevel {
        LogLevel::Off
    }

    fn error(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn debug(&self, _msg: &str) {}
    fn trace(&self, _msg: &str) {}
}

/// Writes messages at or below the configured level to standard error.
pub struct StderrLogger {
    level: LogLevel,
}

impl StderrLogger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    fn write(&self, prefix: &str, msg: &str) {
        eprintln!("{}: {}", prefix, msg);
    }
}

impl Logger for StderrLogger {
    fn level(&self) -> LogLevel {
        self.level
    }

    fn error(&self, msg: &str) {
        self.write("error", msg);
    }

    fn info(&self, msg: &str) {
        self.write("info", msg);
    }

    fn debug(&self, msg: &str) {
        self.write("debug", msg);
    }

    fn trace(&self, msg: &str) {
        self.write("trace", msg);
    }
}

#[macro_export]
macro_rules! trace {
    ($logger:expr, $($args:tt)*) => {{
        use $crate::logger::{LogLevel, Logger};
        if $logger.level() >= LogLevel::Trace {
            $logger.trace(&format!($($args)*));
        }
    }};
}

#[macro_export]
macro_rules! debug {
    ($logger:expr, $($args:tt)*) => {{
        use $crate::logger::{LogLevel, Logger};
        if $logger.level() >= LogLevel::Debug {
            $logger.debug(&format!($($args)*));
        }
    }};
}

#[macro_export]
macro_rules! info {
    ($logger:expr, $($args:tt)*) => {{
        use $crate::logger::{LogLevel, Logger};
        if $logger.level() >= LogLevel::Info {
            $logger.info(&format!($($args)*));
        }
    }};
}

#[macro_export]
macro_rules! error {
    ($logger:expr, $($args:tt)*) => {{
        use $crate::logger::{LogLevel, Logger};
        if $logger.level() >= LogLevel::Error {
            $logger.error(&format!($($args)*));
        }
    }};
}
