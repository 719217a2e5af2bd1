//! Broker-backed telemetry publisher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{BrokerConnectionManager, Result};
use crate::envelope::TelemetryEnvelope;
use crate::publish::{PublishStats, TelemetryPublisher};

/// Publishes envelopes as compact JSON to an exchange.
///
/// Sends are fire-and-forget: `publish` returns once the frame is handed to
/// the broker client. Serialization and send failures are logged and counted
/// in [`PublishStats`], never returned to the caller.
pub struct BrokerPublisher {
    manager: BrokerConnectionManager,
    exchange: String,
    routing_key: String,
    stats: Arc<PublishStats>,
}

impl BrokerPublisher {
    /// Take ownership of `manager` and publish to `exchange` / `routing_key`.
    pub fn new(
        manager: BrokerConnectionManager,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            stats: PublishStats::new(),
        }
    }

    /// Report into an existing stats instance (e.g. one shared with a queue).
    pub fn with_stats(mut self, stats: Arc<PublishStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<PublishStats> {
        &self.stats
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Serialize and send, surfacing any failure.
    pub async fn try_send(&self, envelope: &TelemetryEnvelope) -> Result<()> {
        let payload = envelope.to_json()?;
        self.manager
            .publish(&self.exchange, &self.routing_key, &payload)
            .await
    }

    /// Close the underlying channel and connection.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }
}

#[async_trait]
impl TelemetryPublisher for BrokerPublisher {
    async fn send(&self, envelope: TelemetryEnvelope) {
        match self.try_send(&envelope).await {
            Ok(()) => {
                self.stats.record_sent();
                debug!(
                    id = %envelope.id,
                    kind = envelope.kind(),
                    exchange = %self.exchange,
                    routing_key = %self.routing_key,
                    "Published telemetry"
                );
            }
            Err(e) => {
                self.stats.record_failed();
                warn!(
                    id = %envelope.id,
                    kind = envelope.kind(),
                    exchange = %self.exchange,
                    error = %e,
                    "Telemetry publish failed, record dropped"
                );
            }
        }
    }
}
