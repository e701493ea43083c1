//! Driver message → envelope → publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{Instrument, Span};

use dongle_common::{Clock, DataEnvelope, DeviceId};

use crate::driver::{DriverCallback, DriverMessage};
use crate::middleware::Middleware;

/// Data-path callback registered with the driver.
///
/// Each text reading is wrapped in a [`DataEnvelope`] stamped with one clock
/// reading and handed to [`Middleware::publish_id`] immediately. Binary
/// messages are dropped.
pub struct DataPath {
    device_id: DeviceId,
    middleware: Arc<dyn Middleware>,
    clock: Arc<dyn Clock>,
    span: Span,
    stats: PipelineStats,
}

/// Counters for the data path.
#[derive(Debug, Default)]
pub struct PipelineStats {
    published: AtomicU64,
    failed: AtomicU64,
    dropped_binary: AtomicU64,
}

impl PipelineStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped_binary(&self) -> u64 {
        self.dropped_binary.load(Ordering::Relaxed)
    }
}

impl DataPath {
    pub fn new(
        device_id: DeviceId,
        middleware: Arc<dyn Middleware>,
        clock: Arc<dyn Clock>,
        span: Span,
    ) -> Self {
        Self {
            device_id,
            middleware,
            clock,
            span,
            stats: PipelineStats::default(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    async fn publish_text(&self, text: String) {
        let envelope = DataEnvelope::at(self.clock.now(), text);

        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Failed to serialize envelope");
                return;
            }
        };

        match self
            .middleware
            .publish_id(&self.device_id, payload, None)
            .await
        {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(epoch = envelope.epoch, "Reading published");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Failed to publish reading");
            }
        }
    }
}

#[async_trait]
impl DriverCallback for DataPath {
    async fn handle_message(&self, message: DriverMessage) {
        match message {
            DriverMessage::Text(text) => {
                self.publish_text(text).instrument(self.span.clone()).await;
            }
            DriverMessage::Binary(bytes) => {
                self.stats.dropped_binary.fetch_add(1, Ordering::Relaxed);
                self.span.in_scope(|| {
                    tracing::trace!(len = bytes.len(), "Ignoring binary message");
                });
            }
        }
    }
}
