//! Broker-side collaborator contract.
//!
//! The orchestrator only ever talks to the broker through [`Middleware`]. The
//! implementation owns transport, credentials, fail-over and QoS; the
//! orchestrator observes it purely through the outcome of each call.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dongle_common::{ConfigMap, DeviceDescriptor, DeviceId};

use crate::error::{BridgeError, Result};

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl FromStr for Qos {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" => Ok(Qos::AtMostOnce),
            "1" => Ok(Qos::AtLeastOnce),
            "2" => Ok(Qos::ExactlyOnce),
            other => Err(BridgeError::invalid_setting("qos", other, "expected 0, 1 or 2")),
        }
    }
}

/// Broker credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Values that replace the configured primary broker for one connect call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credentials: Option<Credentials>,
}

/// State of the broker link as tracked by the middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Link lost; reconnecting in the background.
    Retrying,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Retrying => write!(f, "retrying"),
        }
    }
}

/// Capability set the orchestrator needs from the broker client.
///
/// All methods take `&self`: one instance is shared between startup
/// sequencing, the data path and shutdown.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Interpret the options this middleware consumes.
    fn init(&self, options: &ConfigMap) -> Result<()>;

    /// Establish the broker link, trying fail-over brokers as configured.
    ///
    /// Returns once connected or after the fail-over list is exhausted.
    async fn connect(&self, overrides: ConnectOverrides) -> Result<()>;

    /// Announce a device served by this dongle.
    async fn add_device(&self, device: &DeviceDescriptor) -> Result<()>;

    /// Hand a payload over for delivery on the device's data topic.
    ///
    /// Returning `Ok` means accepted for delivery, not delivered.
    async fn publish_id(
        &self,
        device_id: &DeviceId,
        payload: Vec<u8>,
        qos: Option<Qos>,
    ) -> Result<()>;

    /// Release the broker link.
    async fn disconnect(&self) -> Result<()>;
}
