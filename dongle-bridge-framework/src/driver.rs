//! Device-side collaborator contract.
//!
//! A [`Driver`] owns the physical link and its read loop. It pushes every
//! decoded message to the [`DriverCallback`] registered through
//! [`Driver::subscribe`], one at a time and in the order it produced them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::Result;

/// A message decoded by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverMessage {
    /// Raw bytes the driver could not render as text.
    Binary(Vec<u8>),
    /// A textual reading.
    Text(String),
}

impl DriverMessage {
    /// Classify a raw frame: valid UTF-8 becomes `Text`, anything else `Binary`.
    pub fn from_frame(frame: Vec<u8>) -> Self {
        match String::from_utf8(frame) {
            Ok(text) => DriverMessage::Text(text),
            Err(e) => DriverMessage::Binary(e.into_bytes()),
        }
    }
}

/// Receiver of driver messages.
///
/// The driver awaits each call before delivering the next message, so
/// implementations must return promptly.
#[async_trait]
pub trait DriverCallback: Send + Sync {
    async fn handle_message(&self, message: DriverMessage);
}

/// A device driver bound to one physical endpoint.
pub trait Driver: Send {
    /// Start delivering messages matching `filter` (all when `None`) to `callback`.
    fn subscribe(
        &mut self,
        filter: Option<&str>,
        callback: Arc<dyn DriverCallback>,
    ) -> Result<Subscription>;
}

/// Constructs a driver bound to an endpoint.
pub trait DriverFactory: Send + Sync {
    fn create(&self, endpoint: &str) -> Result<Box<dyn Driver>>;
}

/// Handle to an active driver subscription.
///
/// The delivery task stops when the handle is cancelled or dropped.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Track a spawned delivery task.
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// A subscription with no background task (push comes from elsewhere).
    pub fn detached() -> Self {
        Self { task: None }
    }

    /// Whether the delivery task is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop delivery.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_classification() {
        assert_eq!(
            DriverMessage::from_frame(b"SPO2=098%".to_vec()),
            DriverMessage::Text("SPO2=098%".to_string())
        );
        assert_eq!(
            DriverMessage::from_frame(vec![0xff, 0x00]),
            DriverMessage::Binary(vec![0xff, 0x00])
        );
    }

    #[tokio::test]
    async fn test_subscription_cancel_stops_task() {
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let mut subscription = Subscription::new(task);
        assert!(subscription.is_active());

        subscription.cancel();
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_detached_subscription() {
        let subscription = Subscription::detached();
        assert!(!subscription.is_active());
    }
}
