//! `tracing` bridge: forwards events to fan-out loggers keyed by target.

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::{DispatchMark, EventId, FanOutLogger, FanOutLoggerFactory, Level, DIAGNOSTIC_TARGET};

/// Forwards `tracing` events into fan-out loggers, one logger per event target.
///
/// Events raised while a record is being dispatched, on the calling thread or
/// inside a sink on a dispatch worker, are dropped rather than forwarded.
pub struct FanOutLayer {
    factory: FanOutLoggerFactory,
    loggers: Mutex<HashMap<String, Arc<FanOutLogger>>>,
}

impl FanOutLayer {
    pub fn new(factory: FanOutLoggerFactory) -> Self {
        Self {
            factory,
            loggers: Mutex::new(HashMap::new()),
        }
    }

    fn logger(&self, target: &str) -> Option<Arc<FanOutLogger>> {
        let mut loggers = self
            .loggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(logger) = loggers.get(target) {
            return Some(Arc::clone(logger));
        }

        let logger = Arc::new(self.factory.create_logger(target).ok()?);
        loggers.insert(target.to_string(), Arc::clone(&logger));
        Some(logger)
    }
}

impl<S: Subscriber> Layer<S> for FanOutLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(DIAGNOSTIC_TARGET) || DispatchMark::is_active() {
            return;
        }
        let _mark = DispatchMark::enter();

        if let Some(logger) = self.logger(metadata.target()) {
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            logger.log(
                Level::from(metadata.level()),
                EventId::default(),
                visitor,
                None,
                |v, _| v.render(),
            );
        }
    }
}

/// Collects the `message` field and any other fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn render(&self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message.clone(),
            (true, false) => self.fields.clone(),
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}
