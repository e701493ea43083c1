//! Dongle status reporting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};

use dongle_common::{DeviceDescriptor, DeviceId, DongleId};

use crate::error::Result;
use crate::middleware::ConnectionState;
use crate::mqtt::outbox::{Message, Outbox};

/// Lifecycle state carried in a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Running,
    Offline,
}

/// Dongle status information, published retained on the status topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub dongle: DongleId,
    /// Bridge version.
    pub version: String,
    pub status: StatusState,
    /// Devices registered through this dongle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

impl BridgeStatus {
    /// Create a new status with "running" state.
    pub fn running(dongle: DongleId, version: impl Into<String>) -> Self {
        Self {
            dongle,
            version: version.into(),
            status: StatusState::Running,
            devices: Vec::new(),
            uptime_secs: None,
        }
    }

    /// Create a status with "offline" state.
    pub fn offline(dongle: DongleId, version: impl Into<String>) -> Self {
        Self {
            dongle,
            version: version.into(),
            status: StatusState::Offline,
            devices: Vec::new(),
            uptime_secs: None,
        }
    }

    pub fn with_devices(mut self, devices: Vec<DeviceId>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_secs = Some(uptime.as_secs());
        self
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Queues retained status reports for one dongle.
#[derive(Clone)]
pub struct StatusPublisher {
    outbox: Arc<Outbox>,
    topic: String,
    qos: QoS,
    dongle: DongleId,
    version: String,
    devices: Arc<RwLock<Vec<DeviceDescriptor>>>,
    started: Instant,
}

impl StatusPublisher {
    pub(crate) fn new(
        outbox: Arc<Outbox>,
        topic: impl Into<String>,
        qos: QoS,
        dongle: DongleId,
        devices: Arc<RwLock<Vec<DeviceDescriptor>>>,
    ) -> Self {
        Self {
            outbox,
            topic: topic.into(),
            qos,
            dongle,
            version: env!("CARGO_PKG_VERSION").to_string(),
            devices,
            started: Instant::now(),
        }
    }

    /// Current "running" report.
    pub async fn running(&self) -> BridgeStatus {
        let devices = self
            .devices
            .read()
            .await
            .iter()
            .map(|d| d.device_id.clone())
            .collect();
        BridgeStatus::running(self.dongle.clone(), &self.version)
            .with_devices(devices)
            .with_uptime(self.started.elapsed())
    }

    /// Retained "running" report, ready to send.
    pub(crate) async fn running_message(&self) -> Result<Message> {
        let status = self.running().await;
        self.message(&status)
    }

    /// Queue "running" status with the registered devices.
    pub async fn publish_running(&self) -> Result<()> {
        let message = self.running_message().await?;
        self.outbox.push(message);
        Ok(())
    }

    /// Queue "offline" status.
    pub fn publish_offline(&self) -> Result<()> {
        let status = BridgeStatus::offline(self.dongle.clone(), &self.version)
            .with_uptime(self.started.elapsed());
        self.outbox.push(self.message(&status)?);
        Ok(())
    }

    /// Republish "running" status every `interval` while the link is up.
    pub async fn run(self, interval: Duration, state: watch::Receiver<ConnectionState>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; each session reports on open.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if *state.borrow() != ConnectionState::Connected {
                continue;
            }
            if let Err(e) = self.publish_running().await {
                tracing::debug!(error = %e, "Failed to queue status report");
            }
        }
    }

    fn message(&self, status: &BridgeStatus) -> Result<Message> {
        Ok(Message::new(self.topic.clone(), status.to_json()?, self.qos, true))
    }
}

/// Payload registered as the broker-side last will.
pub fn offline_payload(dongle: &DongleId) -> Result<Vec<u8>> {
    BridgeStatus::offline(dongle.clone(), env!("CARGO_PKG_VERSION")).to_json()
}
