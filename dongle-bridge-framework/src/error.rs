//! Error types for the bridge framework.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur in a bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration loading error.
    #[error(transparent)]
    Config(#[from] dongle_common::Error),

    /// An option could not be interpreted by the collaborator consuming it.
    #[error("Invalid value '{value}' for option '{key}': {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },

    /// The broker link could not be established.
    #[error("Middleware startup failed: {0}")]
    MiddlewareStartup(String),

    /// A broker operation was attempted before a successful connect.
    #[error("Middleware is not connected")]
    NotConnected,

    /// The device link could not be opened or subscribed.
    #[error("Driver startup failed: {0}")]
    DriverStartup(String),

    /// Announcing the device to the broker failed.
    #[error("Device registration failed: {0}")]
    Registration(String),

    /// Publishing error.
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create an invalid setting error.
    pub fn invalid_setting(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a middleware startup error.
    pub fn middleware(msg: impl Into<String>) -> Self {
        Self::MiddlewareStartup(msg.into())
    }

    /// Create a driver startup error.
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::DriverStartup(msg.into())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
