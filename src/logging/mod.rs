//! Fan-out logging.
//!
//! One log call is broadcast to every configured sink. Sinks are created
//! per category by [`SinkProvider`]s and decide for themselves whether a
//! record at a given level is written.
//!
//! This module contains:
//! - `LogSink` / `SinkProvider` traits: the capability a sink must expose
//! - `FanOutLogger`: concurrent broadcast with per-sink failure capture
//! - `FanOutLoggerFactory`: category to sink selection from configuration
//! - `ScopeProvider`: scopes shared by all sinks of a logger family
//! - `FanOutLayer`: bridge from `tracing` events into fan-out loggers

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

mod fanout;
mod layer;
mod scope;

pub use fanout::{DispatchReport, FanOutLogger, FanOutLoggerFactory, SinkFailure};
pub use layer::FanOutLayer;
pub use scope::{ScopeGuard, ScopeProvider};

/// Target used for the logger's own diagnostics. Never fanned out.
pub(crate) const DIAGNOSTIC_TARGET: &str = "callwatch::logging";

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a fan-out dispatch until dropped.
///
/// Set by the `tracing` bridge and by every sink call, so events a sink
/// raises are not forwarded back into the fan-out loggers.
pub(crate) struct DispatchMark {
    previous: bool,
}

impl DispatchMark {
    pub(crate) fn enter() -> Self {
        Self {
            previous: DISPATCHING.with(|d| d.replace(true)),
        }
    }

    pub(crate) fn is_active() -> bool {
        DISPATCHING.with(Cell::get)
    }
}

impl Drop for DispatchMark {
    fn drop(&mut self) {
        DISPATCHING.with(|d| d.set(self.previous));
    }
}

// ============================================================================
// Records
// ============================================================================

/// Log severity, lowest first. `None` disables logging when used as a threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    None,
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::None => "none",
        };
        f.write_str(name)
    }
}

/// Identifies a kind of log event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventId {
    pub id: i32,
    pub name: Option<String>,
}

impl EventId {
    pub fn new(id: i32) -> Self {
        Self { id, name: None }
    }

    pub fn named(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }
}

/// A fully rendered log entry, identical for every sink it is sent to.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub category: String,
    pub level: Level,
    pub event_id: EventId,
    pub message: String,
    pub error: Option<String>,
    /// Open scopes, outermost first.
    pub scopes: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Sink capability
// ============================================================================

/// Errors a sink can report for a single record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Sink write failed: {0}")]
    Write(String),

    #[error("Sink panicked: {0}")]
    Panicked(String),
}

/// A log destination bound to one category.
pub trait LogSink: Send + Sync {
    fn is_enabled(&self, level: Level) -> bool;

    fn log(&self, record: &LogRecord) -> Result<(), SinkError>;
}

/// Creates category-bound sinks.
pub trait SinkProvider: Send + Sync {
    /// Name used to reference this provider from configuration.
    fn name(&self) -> &str;

    fn create_logger(&self, category: &str) -> Arc<dyn LogSink>;
}

/// Errors raised while building loggers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoggingError {
    #[error("Logger category must not be empty")]
    EmptyCategory,

    #[error("Unknown sink provider '{0}'")]
    UnknownSink(String),

    #[error("Failed to start log dispatch workers: {0}")]
    WorkerPool(String),
}
