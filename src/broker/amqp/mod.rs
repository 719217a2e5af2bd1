//! AMQP (RabbitMQ) broker connector.
//!
//! Publishes to a pre-provisioned exchange. Publisher confirms are not
//! awaited: a publish completes once lapin has queued the frame.

use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::debug;

use super::{BrokerChannel, BrokerConnection, BrokerError, ConnectionDescriptor, Connector, Result};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections from connection descriptors.
#[derive(Clone, Debug, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }

    /// Build the AMQP URI for a descriptor.
    pub fn uri(descriptor: &ConnectionDescriptor) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: descriptor.user.clone(),
                    password: descriptor.password.clone(),
                },
                host: descriptor.host.clone(),
                port: descriptor.port,
            },
            vhost: descriptor.vhost.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn BrokerConnection>> {
        let connection = Connection::connect_uri(Self::uri(descriptor), ConnectionProperties::default())
            .await
            .map_err(|e| {
                BrokerError::Connection(format!(
                    "Failed to connect to {}: {}",
                    descriptor.endpoint(),
                    e
                ))
            })?;

        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_content_encoding("utf-8".into());

        // The confirm is dropped unawaited.
        let _confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(exchange = %exchange, routing_key = %routing_key, bytes = payload.len(), "Frame queued");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to close channel: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_from_descriptor() {
        let descriptor =
            ConnectionDescriptor::parse("host=broker1;port=5673;user=svc;pass=secret;vhost=/app")
                .unwrap();

        let uri = AmqpConnector::uri(&descriptor);

        assert_eq!(uri.authority.host, "broker1");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "svc");
        assert_eq!(uri.authority.userinfo.password, "secret");
        assert_eq!(uri.vhost, "/app");
    }

    #[test]
    fn test_uri_defaults() {
        let uri = AmqpConnector::uri(&ConnectionDescriptor::default());

        assert_eq!(uri.authority.host, "localhost");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: CALLWATCH_AMQP="host=localhost" cargo test amqp_integration -- --ignored
#[cfg(test)]
mod amqp_integration {
    use super::*;
    use crate::broker::{BrokerConnectionManager, BrokerPublisher};
    use crate::envelope::{EventTelemetry, TelemetryEnvelope, TelemetryItem};
    use crate::publish::TelemetryPublisher;

    fn descriptor() -> String {
        std::env::var("CALLWATCH_AMQP").unwrap_or_else(|_| "host=localhost".to_string())
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn test_publish_to_default_exchange() {
        let manager = BrokerConnectionManager::connect_str(&AmqpConnector::new(), &descriptor())
            .await
            .expect("Failed to connect");
        // The default exchange always exists.
        let publisher = BrokerPublisher::new(manager, "", "callwatch-test");

        publisher
            .publish(TelemetryEnvelope::new(TelemetryItem::Event(EventTelemetry {
                name: "integration".to_string(),
                ..Default::default()
            })))
            .await;

        assert_eq!(publisher.stats().snapshot().sent, 1);
        publisher.close().await.expect("Failed to close");
    }

    #[tokio::test]
    #[ignore = "Opens a real socket"]
    async fn test_unreachable_broker_fails_construction() {
        let result =
            BrokerConnectionManager::connect_str(&AmqpConnector::new(), "host=127.0.0.1;port=1")
                .await;
        assert!(matches!(result, Err(BrokerError::Connection(_))));
    }
}
