//! Bounded background queue in front of a publisher.
//!
//! Takes the transport send off the request path: `send` only enqueues, and a
//! single drain task forwards envelopes to the inner publisher in order.
//! When the queue is full the configured [`OverflowPolicy`] decides what is
//! lost, and every loss is counted in [`PublishStats`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PublishStats, TelemetryPublisher};
use crate::envelope::TelemetryEnvelope;

/// What to do when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming envelope.
    #[default]
    DropNewest,
    /// Evict the oldest queued envelope to make room.
    DropOldest,
    /// Wait until the drain task frees a slot.
    Block,
}

struct Shared {
    queue: Mutex<VecDeque<TelemetryEnvelope>>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Signalled when an envelope is enqueued or the queue closes.
    items: Notify,
    /// Signalled when the drain task frees a slot.
    space: Notify,
    closed: AtomicBool,
    stats: Arc<PublishStats>,
}

enum Enqueue {
    Accepted,
    Dropped,
    Full(TelemetryEnvelope),
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TelemetryEnvelope>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_enqueue(&self, envelope: TelemetryEnvelope) -> Enqueue {
        let mut queue = self.lock();

        if self.closed.load(Ordering::Acquire) {
            return Enqueue::Dropped;
        }

        if queue.len() < self.capacity {
            queue.push_back(envelope);
            return Enqueue::Accepted;
        }

        match self.policy {
            OverflowPolicy::DropNewest => Enqueue::Dropped,
            OverflowPolicy::DropOldest => {
                if queue.pop_front().is_some() {
                    self.stats.record_dropped();
                }
                queue.push_back(envelope);
                Enqueue::Accepted
            }
            OverflowPolicy::Block => Enqueue::Full(envelope),
        }
    }

    fn pop(&self) -> Option<TelemetryEnvelope> {
        self.lock().pop_front()
    }
}

/// Publisher that buffers envelopes in a bounded queue drained by a
/// background task.
///
/// Must be created inside a tokio runtime.
pub struct QueuedPublisher {
    shared: Arc<Shared>,
    drain: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QueuedPublisher {
    /// Start the drain task forwarding to `inner`.
    ///
    /// `capacity` is clamped to at least one slot.
    pub fn spawn(
        inner: Arc<dyn TelemetryPublisher>,
        capacity: usize,
        policy: OverflowPolicy,
        stats: Arc<PublishStats>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            policy,
            items: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            stats,
        });

        let handle = tokio::spawn(Self::drain(Arc::clone(&shared), inner));

        Self {
            shared,
            drain: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    async fn drain(shared: Arc<Shared>, inner: Arc<dyn TelemetryPublisher>) {
        loop {
            match shared.pop() {
                Some(envelope) => {
                    shared.space.notify_one();
                    inner.send(envelope).await;
                }
                None if shared.closed.load(Ordering::Acquire) => break,
                None => shared.items.notified().await,
            }
        }
        debug!("Telemetry queue drained");
    }

    pub fn stats(&self) -> &Arc<PublishStats> {
        &self.shared.stats
    }

    /// Number of envelopes waiting to be sent.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting envelopes and wait for queued ones to be sent.
    pub async fn shutdown(&self) {
        self.close();
        if let Some(handle) = self.drain.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Telemetry drain task failed");
            }
        }
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.items.notify_one();
        self.shared.space.notify_waiters();
    }
}

impl Drop for QueuedPublisher {
    fn drop(&mut self) {
        // Lets the drain task flush and exit.
        self.close();
    }
}

#[async_trait]
impl TelemetryPublisher for QueuedPublisher {
    async fn send(&self, mut envelope: TelemetryEnvelope) {
        loop {
            match self.shared.try_enqueue(envelope) {
                Enqueue::Accepted => {
                    self.shared.stats.record_enqueued();
                    self.shared.items.notify_one();
                    return;
                }
                Enqueue::Dropped => {
                    self.shared.stats.record_dropped();
                    warn!(
                        capacity = self.shared.capacity,
                        "Telemetry queue full or closed, envelope dropped"
                    );
                    return;
                }
                Enqueue::Full(rejected) => {
                    envelope = rejected;
                    self.shared.space.notified().await;
                }
            }
        }
    }
}
