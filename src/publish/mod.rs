//! Telemetry publishing.
//!
//! This module contains:
//! - `TelemetryPublisher` trait: stamps envelopes and hands them to a transport
//! - `PublishStats`: counters shared by publishers for delivery visibility
//! - Implementations: `QueuedPublisher` (bounded background queue),
//!   `RecordingPublisher` (in-memory, for tests)
//!
//! The broker-backed publisher lives in [`crate::broker`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::TelemetryEnvelope;

pub mod mock;
pub mod queued;

pub use mock::RecordingPublisher;
pub use queued::{OverflowPolicy, QueuedPublisher};

// ============================================================================
// Traits
// ============================================================================

/// Publishes telemetry envelopes.
///
/// Delivery is best-effort: neither method reports failure to the caller.
/// Implementations must be safe to call concurrently from many in-flight
/// requests.
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    /// Transport-specific send of an already stamped envelope.
    async fn send(&self, envelope: TelemetryEnvelope);

    /// Assign a fresh id and UTC timestamp, then send.
    ///
    /// Any id or timestamp set by the caller is overwritten.
    async fn publish(&self, mut envelope: TelemetryEnvelope) {
        envelope.stamp();
        self.send(envelope).await;
    }
}

#[async_trait]
impl<P: TelemetryPublisher + ?Sized> TelemetryPublisher for Arc<P> {
    async fn send(&self, envelope: TelemetryEnvelope) {
        (**self).send(envelope).await;
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Delivery counters.
///
/// `enqueued` and `dropped` are maintained by queueing publishers;
/// `sent` and `failed` by transport publishers.
#[derive(Debug, Default)]
pub struct PublishStats {
    enqueued: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`PublishStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishSnapshot {
    pub enqueued: u64,
    pub sent: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl PublishStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PublishSnapshot {
        PublishSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
