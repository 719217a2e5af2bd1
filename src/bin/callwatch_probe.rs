//! Broker connectivity check.
//!
//! Loads configuration, connects to the telemetry broker, publishes one
//! event envelope and closes the connection. Exits non-zero on failure.

use std::collections::BTreeMap;

use callwatch::broker::AmqpConnector;
use callwatch::config::Config;
use callwatch::envelope::{EventTelemetry, TelemetryEnvelope, TelemetryItem};
use callwatch::utils::bootstrap::init_tracing;
use callwatch::{TelemetryPipeline, TelemetryPublisher};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(None);

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let pipeline = TelemetryPipeline::connect(&AmqpConnector::new(), &config.telemetry).await?;

    let mut properties = BTreeMap::new();
    properties.insert("host".to_string(), hostname());
    pipeline
        .publisher()
        .publish(TelemetryEnvelope::new(TelemetryItem::Event(EventTelemetry {
            name: "callwatch.probe".to_string(),
            properties,
            ..Default::default()
        })))
        .await;

    pipeline.shutdown().await?;

    let stats = pipeline.stats().snapshot();
    info!(sent = stats.sent, failed = stats.failed, "Probe complete");
    if stats.sent == 0 {
        return Err("probe envelope was not sent".into());
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
