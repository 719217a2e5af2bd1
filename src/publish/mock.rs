//! In-memory publisher for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TelemetryPublisher;
use crate::envelope::TelemetryEnvelope;

/// Records every envelope it is asked to send.
#[derive(Default)]
pub struct RecordingPublisher {
    published: RwLock<Vec<TelemetryEnvelope>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<TelemetryEnvelope> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<TelemetryEnvelope> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl TelemetryPublisher for RecordingPublisher {
    async fn send(&self, envelope: TelemetryEnvelope) {
        self.published.write().await.push(envelope);
    }
}
