//! Concurrent broadcast of log records to sinks.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::warn;

use super::{
    DispatchMark, EventId, Level, LogRecord, LogSink, LoggingError, ScopeGuard, ScopeProvider,
    SinkError, SinkProvider, DIAGNOSTIC_TARGET,
};
use crate::config::LoggingConfig;

/// One sink that failed to take a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
    /// Position of the sink in the logger's sink list.
    pub sink: usize,
    pub error: SinkError,
}

/// Outcome of broadcasting one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Sinks that wrote the record.
    pub delivered: usize,
    /// Sinks that declined the record's level.
    pub skipped: usize,
    pub failures: Vec<SinkFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Delivery {
    Delivered,
    Skipped,
    Failed(SinkError),
}

fn deliver(sink: &dyn LogSink, record: &LogRecord) -> Delivery {
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        let _mark = DispatchMark::enter();
        if !sink.is_enabled(record.level) {
            return Ok(false);
        }
        sink.log(record).map(|_| true)
    }));

    match attempt {
        Ok(Ok(true)) => Delivery::Delivered,
        Ok(Ok(false)) => Delivery::Skipped,
        Ok(Err(e)) => Delivery::Failed(e),
        Err(payload) => Delivery::Failed(SinkError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Start the dispatch workers shared by one logger family.
fn worker_pool(workers: usize) -> Result<Arc<ThreadPool>, LoggingError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("callwatch-log-{}", i))
        .build()
        .map(Arc::new)
        .map_err(|e| LoggingError::WorkerPool(e.to_string()))
}

/// Broadcasts each log call to a fixed set of category-bound sinks.
///
/// Immutable once built. [`create_logger`] derives an independent logger for
/// another category; the two share only their scope provider and worker pool.
///
/// [`create_logger`]: FanOutLogger::create_logger
pub struct FanOutLogger {
    category: String,
    providers: Arc<[Arc<dyn SinkProvider>]>,
    sinks: Vec<Arc<dyn LogSink>>,
    scopes: Arc<ScopeProvider>,
    pool: Arc<ThreadPool>,
}

impl FanOutLogger {
    /// Build a logger for `category` with one sink per provider, dispatching
    /// on one worker per available processing unit.
    pub fn new(
        category: &str,
        providers: Vec<Arc<dyn SinkProvider>>,
    ) -> Result<Self, LoggingError> {
        Self::with_workers(category, providers, default_workers())
    }

    /// Like [`new`](FanOutLogger::new) with an explicit worker count.
    pub fn with_workers(
        category: &str,
        providers: Vec<Arc<dyn SinkProvider>>,
        workers: usize,
    ) -> Result<Self, LoggingError> {
        Self::build(category, providers.into(), ScopeProvider::new(), worker_pool(workers)?)
    }

    fn build(
        category: &str,
        providers: Arc<[Arc<dyn SinkProvider>]>,
        scopes: Arc<ScopeProvider>,
        pool: Arc<ThreadPool>,
    ) -> Result<Self, LoggingError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(LoggingError::EmptyCategory);
        }

        let sinks = providers
            .iter()
            .map(|provider| provider.create_logger(category))
            .collect();

        Ok(Self {
            category: category.to_string(),
            providers,
            sinks,
            scopes,
            pool,
        })
    }

    /// New logger for `category`, with fresh sinks from the same providers.
    pub fn create_logger(&self, category: &str) -> Result<FanOutLogger, LoggingError> {
        Self::build(
            category,
            Arc::clone(&self.providers),
            Arc::clone(&self.scopes),
            Arc::clone(&self.pool),
        )
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Size of the dispatch worker pool.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Always true; each sink applies its own level filter.
    pub fn is_enabled(&self, _level: Level) -> bool {
        true
    }

    /// Open a scope visible to every sink of this logger family.
    pub fn begin_scope(&self, state: impl fmt::Display) -> ScopeGuard {
        self.scopes.begin(state)
    }

    pub fn scopes(&self) -> &Arc<ScopeProvider> {
        &self.scopes
    }

    /// Render `state` with `formatter` once and broadcast it to every sink.
    ///
    /// Blocks until every sink has been attempted. Sink errors and panics are
    /// captured in the report and never stop delivery to the other sinks.
    pub fn log<S, F>(
        &self,
        level: Level,
        event_id: EventId,
        state: S,
        error: Option<&dyn Error>,
        formatter: F,
    ) -> DispatchReport
    where
        F: FnOnce(&S, Option<&dyn Error>) -> String,
    {
        let record = LogRecord {
            category: self.category.clone(),
            level,
            event_id,
            message: formatter(&state, error),
            error: error.map(|e| e.to_string()),
            scopes: self.scopes.current(),
            timestamp: Utc::now(),
        };
        self.dispatch(&record)
    }

    /// Broadcast a plain message.
    pub fn log_message(&self, level: Level, message: impl Into<String>) -> DispatchReport {
        self.log(level, EventId::default(), message.into(), None, |m, _| m.clone())
    }

    fn dispatch(&self, record: &LogRecord) -> DispatchReport {
        let outcomes: Vec<(usize, Delivery)> =
            if self.sinks.len() <= 1 || self.pool.current_num_threads() <= 1 {
                self.sinks
                    .iter()
                    .enumerate()
                    .map(|(i, sink)| (i, deliver(sink.as_ref(), record)))
                    .collect()
            } else {
                self.pool.install(|| {
                    self.sinks
                        .par_iter()
                        .enumerate()
                        .map(|(i, sink)| (i, deliver(sink.as_ref(), record)))
                        .collect()
                })
            };

        let mut report = DispatchReport::default();
        for (sink, delivery) in outcomes {
            match delivery {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Skipped => report.skipped += 1,
                Delivery::Failed(error) => report.failures.push(SinkFailure { sink, error }),
            }
        }

        for failure in &report.failures {
            warn!(
                target: DIAGNOSTIC_TARGET,
                category = %self.category,
                sink = failure.sink,
                error = %failure.error,
                "Log sink failed"
            );
        }

        report
    }
}

impl fmt::Debug for FanOutLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanOutLogger")
            .field("category", &self.category)
            .field("sinks", &self.sinks.len())
            .field("workers", &self.workers())
            .finish()
    }
}

/// Builds fan-out loggers whose sinks are chosen per category by configuration.
///
/// All loggers from one factory share its scope provider and worker pool.
pub struct FanOutLoggerFactory {
    providers: HashMap<String, Arc<dyn SinkProvider>>,
    config: LoggingConfig,
    scopes: Arc<ScopeProvider>,
    pool: Arc<ThreadPool>,
}

impl FanOutLoggerFactory {
    /// Register `providers` by name and validate every name `config` references.
    pub fn from_config(
        config: LoggingConfig,
        providers: Vec<Arc<dyn SinkProvider>>,
    ) -> Result<Self, LoggingError> {
        Self::with_workers(config, providers, default_workers())
    }

    /// Like [`from_config`](FanOutLoggerFactory::from_config) with an explicit
    /// worker count.
    pub fn with_workers(
        config: LoggingConfig,
        providers: Vec<Arc<dyn SinkProvider>>,
        workers: usize,
    ) -> Result<Self, LoggingError> {
        let providers: HashMap<String, Arc<dyn SinkProvider>> = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();

        let referenced = config
            .default_sinks
            .iter()
            .chain(config.categories.values().flatten());
        for name in referenced {
            if !providers.contains_key(name) {
                return Err(LoggingError::UnknownSink(name.clone()));
            }
        }

        Ok(Self {
            providers,
            config,
            scopes: ScopeProvider::new(),
            pool: worker_pool(workers)?,
        })
    }

    /// Logger for `category` using its configured sinks, or the defaults.
    pub fn create_logger(&self, category: &str) -> Result<FanOutLogger, LoggingError> {
        let names = self
            .config
            .categories
            .get(category.trim())
            .unwrap_or(&self.config.default_sinks);

        let providers = names
            .iter()
            .map(|name| {
                self.providers
                    .get(name)
                    .cloned()
                    .ok_or_else(|| LoggingError::UnknownSink(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        FanOutLogger::build(
            category,
            providers.into(),
            Arc::clone(&self.scopes),
            Arc::clone(&self.pool),
        )
    }
}
