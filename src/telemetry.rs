//! Telemetry pipeline assembly from configuration.

use std::sync::Arc;

use tracing::info;

use crate::broker::{self, BrokerConnectionManager, BrokerPublisher, Connector};
use crate::config::TelemetryConfig;
use crate::interceptor::RequestInterceptor;
use crate::publish::{PublishStats, QueuedPublisher, TelemetryPublisher};

/// A connected broker publisher, optionally fronted by a bounded queue.
pub struct TelemetryPipeline {
    broker: Arc<BrokerPublisher>,
    queue: Option<Arc<QueuedPublisher>>,
    stats: Arc<PublishStats>,
    config: TelemetryConfig,
}

impl TelemetryPipeline {
    /// Open the broker connection described by `config.connection`.
    ///
    /// Fails if the broker is unreachable; there is no retry. With
    /// `queue.enabled` this must run inside a tokio runtime.
    pub async fn connect(
        connector: &dyn Connector,
        config: &TelemetryConfig,
    ) -> broker::Result<Self> {
        let manager = BrokerConnectionManager::connect_str(connector, &config.connection).await?;
        let stats = PublishStats::new();
        let broker = Arc::new(
            BrokerPublisher::new(manager, &config.exchange, &config.routing_key)
                .with_stats(Arc::clone(&stats)),
        );

        let queue = config.queue.enabled.then(|| {
            Arc::new(QueuedPublisher::spawn(
                broker.clone(),
                config.queue.capacity,
                config.queue.overflow,
                Arc::clone(&stats),
            ))
        });

        info!(
            exchange = %config.exchange,
            routing_key = %config.routing_key,
            queued = queue.is_some(),
            policy = ?config.publish_policy,
            "Telemetry pipeline initialized"
        );

        Ok(Self {
            broker,
            queue,
            stats,
            config: config.clone(),
        })
    }

    /// The publisher requests should use: the queue when enabled, else the broker.
    pub fn publisher(&self) -> Arc<dyn TelemetryPublisher> {
        match &self.queue {
            Some(queue) => queue.clone() as Arc<dyn TelemetryPublisher>,
            None => self.broker.clone() as Arc<dyn TelemetryPublisher>,
        }
    }

    /// Interceptor publishing through this pipeline with the configured policy.
    pub fn interceptor(&self) -> RequestInterceptor {
        RequestInterceptor::new(self.publisher()).with_policy(self.config.publish_policy)
    }

    pub fn stats(&self) -> &Arc<PublishStats> {
        &self.stats
    }

    /// Flush the queue, if any, then close the broker connection.
    pub async fn shutdown(&self) -> broker::Result<()> {
        if let Some(queue) = &self.queue {
            queue.shutdown().await;
        }
        self.broker.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, MemoryConnector};
    use crate::config::QueueConfig;
    use crate::envelope::{EventTelemetry, TelemetryEnvelope, TelemetryItem};
    use crate::interceptor::PublishPolicy;
    use crate::publish::OverflowPolicy;

    fn event(name: &str) -> TelemetryEnvelope {
        TelemetryEnvelope::new(TelemetryItem::Event(EventTelemetry {
            name: name.to_string(),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_direct_pipeline_publishes_to_configured_exchange() {
        let connector = MemoryConnector::new();
        let config = TelemetryConfig {
            exchange: "audit".to_string(),
            routing_key: "audit.calls".to_string(),
            ..Default::default()
        };

        let pipeline = TelemetryPipeline::connect(&connector, &config).await.unwrap();
        pipeline.publisher().publish(event("direct")).await;

        let frames = connector.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].exchange, "audit");
        assert_eq!(frames[0].routing_key, "audit.calls");
        assert_eq!(pipeline.stats().snapshot().sent, 1);
        assert_eq!(pipeline.interceptor().policy(), PublishPolicy::Await);
    }

    #[tokio::test]
    async fn test_queued_pipeline_flushes_on_shutdown() {
        let connector = MemoryConnector::new();
        let config = TelemetryConfig {
            publish_policy: PublishPolicy::Detach,
            queue: QueueConfig {
                enabled: true,
                capacity: 8,
                overflow: OverflowPolicy::Block,
            },
            ..Default::default()
        };

        let pipeline = TelemetryPipeline::connect(&connector, &config).await.unwrap();
        let publisher = pipeline.publisher();
        for i in 0..3 {
            publisher.publish(event(&format!("queued-{}", i))).await;
        }
        pipeline.shutdown().await.unwrap();

        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.sent, 3);
        assert_eq!(connector.frames().len(), 3);
        assert_eq!(connector.open_connections(), 0);
        assert_eq!(pipeline.interceptor().policy(), PublishPolicy::Detach);
    }

    #[tokio::test]
    async fn test_malformed_connection_fails() {
        let config = TelemetryConfig {
            connection: "host".to_string(),
            ..Default::default()
        };

        let result = TelemetryPipeline::connect(&MemoryConnector::new(), &config).await;
        assert!(matches!(result, Err(BrokerError::Descriptor(_))));
    }
}
