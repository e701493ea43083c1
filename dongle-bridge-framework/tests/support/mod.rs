//! Recording collaborators shared by the integration tests.

#![allow(dead_code)]

pub mod broker;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dongle_bridge_framework::{
    BridgeError, ConnectOverrides, Driver, DriverCallback, DriverFactory, DriverMessage,
    Middleware, Qos, Result, Subscription,
};
use dongle_common::{ConfigMap, DataEnvelope, DeviceDescriptor, DeviceId};

/// One collaborator call, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init,
    Connect,
    Subscribe(String),
    AddDevice(DeviceId),
    Publish(DeviceId),
    Disconnect,
}

/// Call log shared by the middleware and driver doubles.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|c| pred(c)).count()
    }
}

/// Middleware double that records every call and keeps published payloads.
#[derive(Default)]
pub struct RecordingMiddleware {
    log: CallLog,
    published: Mutex<Vec<(DeviceId, Vec<u8>, Option<Qos>)>>,
    fail_connect: bool,
    failing_publishes: AtomicUsize,
}

impl RecordingMiddleware {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    /// Fail every `connect` call.
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Fail the next `n` publishes.
    pub fn failing_publishes(self, n: usize) -> Self {
        self.failing_publishes.store(n, Ordering::SeqCst);
        self
    }

    pub fn published(&self) -> Vec<(DeviceId, Vec<u8>, Option<Qos>)> {
        self.published.lock().unwrap().clone()
    }

    /// Published payloads decoded as envelopes.
    pub fn envelopes(&self) -> Vec<DataEnvelope> {
        self.published()
            .into_iter()
            .map(|(_, payload, _)| serde_json::from_slice(&payload).unwrap())
            .collect()
    }
}

#[async_trait]
impl Middleware for RecordingMiddleware {
    fn init(&self, _options: &ConfigMap) -> Result<()> {
        self.log.push(Call::Init);
        Ok(())
    }

    async fn connect(&self, _overrides: ConnectOverrides) -> Result<()> {
        self.log.push(Call::Connect);
        if self.fail_connect {
            return Err(BridgeError::middleware("broker unreachable"));
        }
        Ok(())
    }

    async fn add_device(&self, device: &DeviceDescriptor) -> Result<()> {
        self.log.push(Call::AddDevice(device.device_id.clone()));
        Ok(())
    }

    async fn publish_id(
        &self,
        device_id: &DeviceId,
        payload: Vec<u8>,
        qos: Option<Qos>,
    ) -> Result<()> {
        self.log.push(Call::Publish(device_id.clone()));

        let remaining = self.failing_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(BridgeError::Publish {
                topic: device_id.to_string(),
                message: "injected failure".to_string(),
            });
        }

        self.published
            .lock()
            .unwrap()
            .push((device_id.clone(), payload, qos));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.log.push(Call::Disconnect);
        Ok(())
    }
}

type CallbackSlot = Arc<Mutex<Option<Arc<dyn DriverCallback>>>>;

/// Driver factory whose drivers deliver whatever the test emits.
#[derive(Clone, Default)]
pub struct ScriptedDriverFactory {
    log: CallLog,
    callback: CallbackSlot,
    fail_create: bool,
}

impl ScriptedDriverFactory {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    /// Fail driver construction.
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn is_subscribed(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    /// Deliver a message to the subscribed callback, as the driver's read loop would.
    pub async fn emit(&self, message: DriverMessage) {
        let callback = self
            .callback
            .lock()
            .unwrap()
            .clone()
            .expect("no subscriber");
        callback.handle_message(message).await;
    }
}

impl DriverFactory for ScriptedDriverFactory {
    fn create(&self, endpoint: &str) -> Result<Box<dyn Driver>> {
        if self.fail_create {
            return Err(BridgeError::driver(format!("cannot open {}", endpoint)));
        }
        Ok(Box::new(ScriptedDriver {
            endpoint: endpoint.to_string(),
            log: self.log.clone(),
            callback: self.callback.clone(),
        }))
    }
}

pub struct ScriptedDriver {
    endpoint: String,
    log: CallLog,
    callback: CallbackSlot,
}

impl Driver for ScriptedDriver {
    fn subscribe(
        &mut self,
        _filter: Option<&str>,
        callback: Arc<dyn DriverCallback>,
    ) -> Result<Subscription> {
        self.log.push(Call::Subscribe(self.endpoint.clone()));
        *self.callback.lock().unwrap() = Some(callback);
        Ok(Subscription::detached())
    }
}

pub fn options(pairs: &[(&str, &str)]) -> ConfigMap {
    ConfigMap::from_pairs(pairs.iter().copied())
}
