//! In-memory broker for tests and local development.
//!
//! Records every published frame and supports failure injection for
//! connect, channel open and publish.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{BrokerChannel, BrokerConnection, BrokerError, ConnectionDescriptor, Connector, Result};

/// One frame written to the in-memory broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedFrame {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct MemoryBroker {
    frames: Mutex<Vec<PublishedFrame>>,
    descriptors: Mutex<Vec<ConnectionDescriptor>>,
    connections: AtomicUsize,
    open_connections: AtomicUsize,
    channels: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_connect: AtomicBool,
    fail_channel: AtomicBool,
    fail_publish: AtomicBool,
    severed: AtomicBool,
}

/// Connector for the in-memory broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.broker.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_channel(&self, fail: bool) {
        self.broker.fail_channel.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.broker.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Simulate losing the connection: all later publishes fail.
    pub fn sever(&self) {
        self.broker.severed.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<PublishedFrame> {
        lock(&self.broker.frames).clone()
    }

    /// Descriptors passed to `connect`, in order.
    pub fn descriptors(&self) -> Vec<ConnectionDescriptor> {
        lock(&self.broker.descriptors).clone()
    }

    /// Connections ever opened.
    pub fn connection_count(&self) -> usize {
        self.broker.connections.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.broker.open_connections.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.broker.channels.load(Ordering::SeqCst)
    }

    /// Highest number of publishes observed in flight at once.
    pub fn max_concurrent_publishes(&self) -> usize {
        self.broker.max_in_flight.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn BrokerConnection>> {
        if self.broker.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!(
                "{} unreachable",
                descriptor.endpoint()
            )));
        }

        lock(&self.broker.descriptors).push(descriptor.clone());
        self.broker.connections.fetch_add(1, Ordering::SeqCst);
        self.broker.open_connections.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            broker: Arc::clone(&self.broker),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.broker.fail_channel.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel refused".to_string()));
        }
        self.broker.channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        if self.broker.severed.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("connection lost".to_string()));
        }
        if self.broker.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("publish rejected".to_string()));
        }

        let in_flight = self.broker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.broker.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        tokio::task::yield_now().await;

        lock(&self.broker.frames).push(PublishedFrame {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
        });

        self.broker.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
