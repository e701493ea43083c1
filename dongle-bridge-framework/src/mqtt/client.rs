use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use dongle_common::{ConfigMap, DeviceDescriptor, DeviceId, DongleId, TopicBuilder};

use super::outbox::{Message, Outbox};
use super::session::{self, Configured, SessionContext};
use super::settings::MqttSettings;
use super::{load_transport, to_mqtt_qos};
use crate::error::{BridgeError, Result};
use crate::middleware::{ConnectOverrides, ConnectionState, Middleware, Qos};
use crate::status::StatusPublisher;

/// How long `disconnect` waits for the outbox to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Session {
    status: StatusPublisher,
    stop: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    reporter: Option<JoinHandle<()>>,
}

/// Middleware backed by an MQTT broker connection.
///
/// `init` may be called once. Publishes are accepted into an outbox owned by
/// the middleware and return without waiting for the broker. After a
/// successful `connect`, a background task keeps a session open: when the
/// link drops it reconnects every `retry_interval`, fails over along the
/// broker list, and resends whatever the broker had not acknowledged.
pub struct MqttMiddleware {
    dongle_id: DongleId,
    configured: OnceLock<Arc<Configured>>,
    session: RwLock<Option<Session>>,
    devices: Arc<RwLock<Vec<DeviceDescriptor>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    span: Span,
}

impl MqttMiddleware {
    /// Create a middleware connecting as `dongle_id`.
    pub fn new(dongle_id: DongleId) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let span = tracing::info_span!("mqtt", client_id = %dongle_id);
        Self {
            dongle_id,
            configured: OnceLock::new(),
            session: RwLock::new(None),
            devices: Arc::new(RwLock::new(Vec::new())),
            state: Arc::new(state),
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn dongle_id(&self) -> &DongleId {
        &self.dongle_id
    }

    /// Settings in effect, once initialized.
    pub fn settings(&self) -> Option<&MqttSettings> {
        self.configured.get().map(|c| &c.settings)
    }

    /// Topics in use, once initialized.
    pub fn topics(&self) -> Option<&TopicBuilder> {
        self.configured.get().map(|c| &c.topics)
    }

    /// Watch the connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Devices registered so far.
    pub async fn devices(&self) -> Vec<DeviceId> {
        self.devices
            .read()
            .await
            .iter()
            .map(|d| d.device_id.clone())
            .collect()
    }

    /// Messages accepted but not yet handed to a broker.
    pub fn pending(&self) -> usize {
        self.configured.get().map_or(0, |c| c.outbox.len())
    }

    fn configured(&self) -> Result<&Arc<Configured>> {
        self.configured
            .get()
            .ok_or_else(|| BridgeError::middleware("init must be called before connect"))
    }

    async fn status(&self) -> Result<StatusPublisher> {
        let session = self.session.read().await;
        let session = session.as_ref().ok_or(BridgeError::NotConnected)?;
        Ok(session.status.clone())
    }

    fn enqueue(&self, configured: &Configured, message: Message) {
        let evicted = configured.outbox.push(message);
        if evicted > 0 {
            tracing::warn!(
                parent: &self.span,
                evicted,
                total = configured.outbox.evicted(),
                capacity = configured.settings.outbox_capacity,
                "Outbox full; dropped oldest messages"
            );
        }
    }
}

#[async_trait]
impl Middleware for MqttMiddleware {
    fn init(&self, options: &ConfigMap) -> Result<()> {
        let _entered = self.span.enter();

        let settings = MqttSettings::from_options(options)?;
        let transport = if settings.uses_tls() {
            Some(load_transport(&settings.tls)?)
        } else {
            None
        };
        if let Some(dir) = &settings.db_dir {
            tracing::debug!(db_dir = %dir.display(), "Ignoring db_dir; messages are not persisted");
        }

        let brokers = settings
            .brokers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            brokers = %brokers,
            project = %settings.project_name,
            qos = settings.qos.level(),
            outbox = settings.outbox_capacity,
            "MQTT middleware initialized"
        );

        let topics = TopicBuilder::new(settings.project_name.clone(), self.dongle_id.clone());
        let outbox = Arc::new(Outbox::new(settings.outbox_capacity));
        self.configured
            .set(Arc::new(Configured {
                settings,
                topics,
                transport,
                outbox,
            }))
            .map_err(|_| BridgeError::middleware("middleware already initialized"))
    }

    async fn connect(&self, overrides: ConnectOverrides) -> Result<()> {
        let configured = self.configured()?.clone();
        let settings = &configured.settings;

        let mut slot = self.session.write().await;
        if slot.is_some() {
            tracing::debug!(parent: &self.span, "Already connected");
            return Ok(());
        }

        let status = StatusPublisher::new(
            configured.outbox.clone(),
            configured.topics.status(),
            to_mqtt_qos(settings.qos),
            self.dongle_id.clone(),
            self.devices.clone(),
        );
        let ctx = Arc::new(SessionContext {
            dongle_id: self.dongle_id.clone(),
            configured: configured.clone(),
            credentials: overrides
                .credentials
                .clone()
                .or_else(|| settings.credentials.clone()),
            brokers: settings.candidates(&overrides),
            devices: self.devices.clone(),
            status: status.clone(),
            state: self.state.clone(),
        });

        self.state.send_replace(ConnectionState::Connecting);
        let mut failures = Vec::with_capacity(ctx.brokers.len());

        for (index, broker) in ctx.brokers.iter().enumerate() {
            tracing::info!(parent: &self.span, broker = %broker, "Connecting to broker");

            let connection = match session::open(&ctx, index)
                .instrument(self.span.clone())
                .await
            {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(parent: &self.span, broker = %broker, error = %e, "Broker connection failed");
                    failures.push(format!("{}: {}", broker, e));
                    continue;
                }
            };

            self.state.send_replace(ConnectionState::Connected);
            tracing::info!(parent: &self.span, broker = %broker, "Connected to broker");

            let (stop, stopped) = watch::channel(false);
            let supervisor = tokio::spawn(
                session::supervise(ctx.clone(), connection, stopped).instrument(self.span.clone()),
            );
            let reporter = settings.report_interval.map(|interval| {
                tokio::spawn(
                    status
                        .clone()
                        .run(interval, self.state.subscribe())
                        .instrument(self.span.clone()),
                )
            });

            *slot = Some(Session {
                status,
                stop,
                supervisor,
                reporter,
            });
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Disconnected);
        Err(BridgeError::middleware(format!(
            "no broker reachable ({})",
            failures.join("; ")
        )))
    }

    async fn add_device(&self, device: &DeviceDescriptor) -> Result<()> {
        let status = self.status().await?;
        let configured = self.configured()?;

        let message =
            session::descriptor_message(&configured.topics, to_mqtt_qos(configured.settings.qos), device)?;
        let topic = message.topic.clone();
        {
            let mut devices = self.devices.write().await;
            match devices.iter_mut().find(|d| d.device_id == device.device_id) {
                Some(known) => *known = device.clone(),
                None => devices.push(device.clone()),
            }
        }
        self.enqueue(configured, message);
        tracing::info!(parent: &self.span, device = %device.device_id, topic = %topic, "Device announced");

        if let Err(e) = status.publish_running().await {
            tracing::debug!(parent: &self.span, error = %e, "Failed to refresh status");
        }
        Ok(())
    }

    async fn publish_id(
        &self,
        device_id: &DeviceId,
        payload: Vec<u8>,
        qos: Option<Qos>,
    ) -> Result<()> {
        if self.session.read().await.is_none() {
            return Err(BridgeError::NotConnected);
        }
        let configured = self.configured()?;

        let topic = configured.topics.data(device_id);
        let qos = to_mqtt_qos(qos.unwrap_or(configured.settings.qos));
        self.enqueue(configured, Message::new(topic, payload, qos, false));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.write().await.take() else {
            tracing::debug!(parent: &self.span, "Not connected; nothing to release");
            return Ok(());
        };

        if let Some(reporter) = &session.reporter {
            reporter.abort();
        }
        if let Err(e) = session.status.publish_offline() {
            tracing::warn!(parent: &self.span, error = %e, "Failed to queue offline status");
        }
        session.stop.send_replace(true);

        let mut supervisor = session.supervisor;
        let result = match tokio::time::timeout(DRAIN_TIMEOUT, &mut supervisor).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::middleware(format!("session task failed: {}", e))),
            Err(_) => {
                supervisor.abort();
                Err(BridgeError::Timeout {
                    operation: "disconnect",
                    after: DRAIN_TIMEOUT,
                })
            }
        };

        let undelivered = self.pending();
        if undelivered > 0 {
            tracing::warn!(parent: &self.span, undelivered, "Messages left undelivered");
        }
        self.state.send_replace(ConnectionState::Disconnected);
        tracing::info!(parent: &self.span, "Disconnected from broker");
        result
    }
}
