//! Callwatch - request correlation and telemetry for gRPC services
//!
//! Every inbound call gets an operation id (from the W3C `traceparent`
//! header, a caller-supplied correlation header, or a fresh UUID). When the
//! call completes, a request telemetry envelope carrying the id, timing and
//! outcome is published as JSON to a message broker. A fan-out logger
//! broadcasts log records to any number of independently configured sinks.

pub mod broker;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod interceptor;
pub mod logging;
pub mod publish;
pub mod status;
pub mod telemetry;
pub mod utils;

pub use correlation::{CorrelationTracker, OperationId};
pub use envelope::{TelemetryEnvelope, TelemetryItem};
pub use interceptor::{PublishPolicy, RequestInterceptor};
pub use publish::TelemetryPublisher;
pub use telemetry::TelemetryPipeline;
