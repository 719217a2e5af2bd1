//! Message broker access for telemetry publishing.
//!
//! This module contains:
//! - `Connector` / `BrokerConnection` / `BrokerChannel` traits: the minimal
//!   capability a broker client must expose (open, publish, close)
//! - `BrokerConnectionManager`: owns one connection and one channel for its
//!   whole lifetime
//! - `BrokerPublisher`: `TelemetryPublisher` that writes JSON envelopes to an
//!   exchange
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod descriptor;
pub mod memory;
pub mod publisher;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use descriptor::{ConnectionDescriptor, DescriptorError};
pub use memory::{MemoryConnector, PublishedFrame};
pub use publisher::BrokerPublisher;

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid connection descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel failed: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Broker connection is closed")]
    Closed,
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn BrokerConnection>>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// An open channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Write `payload` to `exchange` under `routing_key`.
    ///
    /// Returns once the frame is handed to the client, without waiting for
    /// a broker acknowledgment.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Owns exactly one broker connection and one channel.
///
/// Both are opened at construction and kept until [`close`] or drop. There
/// is no reconnect: once the connection is lost every publish fails until a
/// new manager is built.
///
/// [`close`]: BrokerConnectionManager::close
pub struct BrokerConnectionManager {
    descriptor: ConnectionDescriptor,
    connection: Box<dyn BrokerConnection>,
    /// Sends are serialized onto the single channel.
    channel: Mutex<Box<dyn BrokerChannel>>,
    closed: AtomicBool,
}

impl BrokerConnectionManager {
    /// Open the connection and channel described by `descriptor`.
    ///
    /// Failure here is a startup failure and is returned to the caller as is.
    pub async fn connect(
        connector: &dyn Connector,
        descriptor: ConnectionDescriptor,
    ) -> Result<Self> {
        let endpoint = descriptor.endpoint();

        let connection = connector.connect(&descriptor).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(match e {
                    BrokerError::Channel(_) => e,
                    other => BrokerError::Channel(other.to_string()),
                });
            }
        };

        info!(endpoint = %endpoint, user = %descriptor.user, "Connected to broker");

        Ok(Self {
            descriptor,
            connection,
            channel: Mutex::new(channel),
            closed: AtomicBool::new(false),
        })
    }

    /// Parse `descriptor` and connect.
    pub async fn connect_str(connector: &dyn Connector, descriptor: &str) -> Result<Self> {
        let descriptor = ConnectionDescriptor::parse(descriptor)?;
        Self::connect(connector, descriptor).await
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish one payload over the managed channel.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let channel = self.channel.lock().await;
        channel.publish(exchange, routing_key, payload).await
    }

    /// Close the channel, then the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let channel_result = self.channel.lock().await.close().await;
        let connection_result = self.connection.close().await;

        info!(endpoint = %self.descriptor.endpoint(), "Broker connection closed");

        channel_result.and(connection_result)
    }
}
