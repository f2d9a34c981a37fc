//! Leveled event sink used for progress and diagnostics.
//!
//! The download engine never prints directly. Everything a user might want
//! to see goes through an [`EventSink`], which embedders can replace.

use std::fmt;

/// Severity of a sink event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
    Info,
    Debug,
    /// Output the user has to see to continue (e.g. the file menu).
    Must,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Must => "MUST",
        };
        f.write_str(name)
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, level: Level, message: &str);

    fn error(&self, message: &str, fault: &dyn std::error::Error) {
        let mut detail = format!("{}: {}", message, fault);
        let mut source = fault.source();
        while let Some(cause) = source {
            detail.push_str(&format!(" (caused by: {})", cause));
            source = cause.source();
        }
        self.emit(Level::Error, &detail);
    }

    fn warning(&self, message: &str) {
        self.emit(Level::Warning, message);
    }

    fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.emit(Level::Debug, message);
    }

    fn must(&self, message: &str) {
        self.emit(Level::Must, message);
    }
}

/// Default sink: forwards to `tracing`, MUST output goes to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, level: Level, message: &str) {
        match level {
            Level::Error => tracing::error!("{}", message),
            Level::Warning => tracing::warn!("{}", message),
            Level::Info => tracing::info!("{}", message),
            Level::Debug => tracing::debug!("{}", message),
            Level::Must => println!("{}", message),
        }
    }
}
