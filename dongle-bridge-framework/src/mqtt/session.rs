//! Broker sessions: connect, feed the outbox, recover, fail over.
//!
//! Every connection attempt gets a fresh `rumqttc` client and event loop.
//! The event loop is polled by its own task and never cancelled mid-poll;
//! the supervisor feeds it from the outbox and tracks what the broker has
//! not acknowledged yet. When the link drops, unacknowledged messages go
//! back to the head of the outbox and the supervisor reconnects, moving to
//! the next broker of the fail-over list after `reconnect_attempts` failures.

use std::collections::VecDeque;
use std::sync::Arc;

use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use dongle_common::{DeviceDescriptor, DongleId, TopicBuilder};

use super::outbox::{Message, Outbox};
use super::settings::{BrokerAddress, MqttSettings, Scheme};
use super::to_mqtt_qos;
use crate::error::{BridgeError, Result};
use crate::middleware::{ConnectionState, Credentials};
use crate::status::{StatusPublisher, offline_payload};

/// Capacity of the request channel between a client handle and its event loop.
const REQUEST_CAPACITY: usize = 64;

/// Messages handed to the event loop and not yet acknowledged.
///
/// Stays below `REQUEST_CAPACITY` so handing over never blocks.
const IN_FLIGHT_LIMIT: usize = 32;

const LINK_EVENT_CAPACITY: usize = 64;

/// Settings resolved by `init`.
pub(crate) struct Configured {
    pub settings: MqttSettings,
    pub topics: TopicBuilder,
    pub transport: Option<Transport>,
    pub outbox: Arc<Outbox>,
}

/// Everything a session needs, shared with the middleware.
pub(crate) struct SessionContext {
    pub dongle_id: DongleId,
    pub configured: Arc<Configured>,
    pub credentials: Option<Credentials>,
    /// Brokers in fail-over order, overrides applied.
    pub brokers: Vec<BrokerAddress>,
    pub devices: Arc<RwLock<Vec<DeviceDescriptor>>>,
    pub status: StatusPublisher,
    pub state: Arc<watch::Sender<ConnectionState>>,
}

impl SessionContext {
    fn settings(&self) -> &MqttSettings {
        &self.configured.settings
    }

    fn outbox(&self) -> &Outbox {
        &self.configured.outbox
    }

    pub fn broker(&self, index: usize) -> Option<&BrokerAddress> {
        self.brokers.get(index)
    }

    /// Messages every new session starts with: the running status and the
    /// retained descriptors of the registered devices.
    async fn openers(&self) -> Vec<Message> {
        let mut messages = Vec::new();
        match self.status.running_message().await {
            Ok(message) => messages.push(message),
            Err(e) => tracing::warn!(error = %e, "Failed to build status report"),
        }
        let qos = self.settings().qos;
        for device in self.devices.read().await.iter() {
            match descriptor_message(&self.configured.topics, to_mqtt_qos(qos), device) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(device = %device.device_id, error = %e, "Failed to build descriptor"),
            }
        }
        messages
    }
}

/// Retained registration message for a device.
pub(crate) fn descriptor_message(
    topics: &TopicBuilder,
    qos: QoS,
    device: &DeviceDescriptor,
) -> Result<Message> {
    Ok(Message::new(
        topics.device(&device.device_id),
        serde_json::to_vec(device)?,
        qos,
        true,
    ))
}

enum LinkEvent {
    Sent(u16),
    Acked(u16),
    Closed,
    Lost(String),
}

/// An accepted broker connection.
pub(crate) struct Connection {
    index: usize,
    client: AsyncClient,
    events: mpsc::Receiver<LinkEvent>,
    poller: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// Open a session with the broker at `index` and wait for its CONNACK.
pub(crate) async fn open(ctx: &SessionContext, index: usize) -> Result<Connection> {
    let broker = ctx
        .broker(index)
        .ok_or_else(|| BridgeError::middleware(format!("no broker at position {}", index)))?;
    let settings = ctx.settings();

    let mut options = MqttOptions::new(ctx.dongle_id.as_str(), broker.host.clone(), broker.port);
    options.set_keep_alive(settings.alive_interval);
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        ctx.configured.topics.status(),
        offline_payload(&ctx.dongle_id)?,
        to_mqtt_qos(settings.qos),
        true,
    ));
    if let Some(credentials) = &ctx.credentials {
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }
    if broker.scheme == Scheme::Tls {
        let transport = ctx
            .configured
            .transport
            .clone()
            .ok_or_else(|| BridgeError::middleware("TLS transport not initialized"))?;
        options.set_transport(transport);
    }

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    eventloop
        .network_options
        .set_connection_timeout(settings.connection_timeout.as_secs().max(1));

    let outcome = tokio::time::timeout(settings.connection_timeout, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => continue,
                Err(e) => return Err(BridgeError::middleware(e.to_string())),
            }
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(BridgeError::Timeout {
                operation: "connect",
                after: settings.connection_timeout,
            });
        }
    }

    let (tx, events) = mpsc::channel(LINK_EVENT_CAPACITY);
    let poller = tokio::spawn(poll_link(eventloop, tx).in_current_span());
    Ok(Connection {
        index,
        client,
        events,
        poller,
    })
}

/// Drive the event loop, forwarding what the supervisor tracks.
async fn poll_link(mut eventloop: EventLoop, events: mpsc::Sender<LinkEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => LinkEvent::Sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => LinkEvent::Acked(ack.pkid),
            Ok(Event::Incoming(Packet::PubComp(comp))) => LinkEvent::Acked(comp.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => LinkEvent::Closed,
            Ok(_) => continue,
            Err(e) => LinkEvent::Lost(e.to_string()),
        };
        let last = matches!(event, LinkEvent::Closed | LinkEvent::Lost(_));
        if events.send(event).await.is_err() || last {
            break;
        }
    }
}

#[derive(Default)]
struct InFlight {
    handed: VecDeque<Message>,
    unacked: Vec<(u16, Message)>,
}

impl InFlight {
    fn len(&self) -> usize {
        self.handed.len() + self.unacked.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_room(&self) -> bool {
        self.len() < IN_FLIGHT_LIMIT
    }

    /// The event loop wrote the oldest handed message to the wire.
    fn sent(&mut self, pkid: u16) {
        if let Some(message) = self.handed.pop_front() {
            if message.qos != QoS::AtMostOnce {
                self.unacked.push((pkid, message));
            }
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(pos) = self.unacked.iter().position(|(id, _)| *id == pkid) {
            self.unacked.remove(pos);
        }
    }

    /// Everything not confirmed, oldest first.
    fn take(&mut self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.unacked.drain(..).map(|(_, m)| m).collect();
        messages.extend(self.handed.drain(..));
        messages
    }
}

enum Ended {
    Closed,
    Lost(String),
}

/// Run sessions until `stop` is raised.
///
/// On stop, a connected session drains the outbox before sending DISCONNECT.
pub(crate) async fn supervise(
    ctx: Arc<SessionContext>,
    mut connection: Connection,
    mut stop: watch::Receiver<bool>,
) {
    let mut in_flight = InFlight::default();

    loop {
        let broker = ctx
            .broker(connection.index)
            .map(ToString::to_string)
            .unwrap_or_default();
        ctx.state.send_replace(ConnectionState::Connected);
        let openers = ctx.openers().await;
        ctx.outbox().requeue(openers);

        match pump(&ctx, &mut connection, &mut in_flight, &mut stop).await {
            Ended::Closed => {
                tracing::debug!(broker = %broker, "Session closed");
                break;
            }
            Ended::Lost(reason) => {
                let unconfirmed = in_flight.take();
                tracing::warn!(
                    broker = %broker,
                    error = %reason,
                    requeued = unconfirmed.len(),
                    "Broker link lost"
                );
                ctx.outbox().requeue(unconfirmed);
                ctx.state.send_replace(ConnectionState::Retrying);
            }
        }

        match reconnect(&ctx, connection.index, &mut stop).await {
            Some(next) => connection = next,
            None => break,
        }
    }

    ctx.state.send_replace(ConnectionState::Disconnected);
}

/// Feed the outbox to one connection until it closes or drops.
async fn pump(
    ctx: &SessionContext,
    connection: &mut Connection,
    in_flight: &mut InFlight,
    stop: &mut watch::Receiver<bool>,
) -> Ended {
    let mut closing = *stop.borrow();
    let mut disconnect_sent = false;

    loop {
        if closing && !disconnect_sent && ctx.outbox().is_empty() && in_flight.is_empty() {
            if let Err(e) = connection.client.try_disconnect() {
                return Ended::Lost(e.to_string());
            }
            disconnect_sent = true;
        }

        tokio::select! {
            _ = stop.changed(), if !closing => closing = true,
            message = ctx.outbox().next(), if !disconnect_sent && in_flight.has_room() => {
                let handed = connection.client.try_publish(
                    message.topic.clone(),
                    message.qos,
                    message.retain,
                    message.payload.clone(),
                );
                match handed {
                    Ok(()) => in_flight.handed.push_back(message),
                    Err(e) => {
                        tracing::warn!(topic = %message.topic, error = %e, "Dropping unpublishable message");
                    }
                }
            }
            event = connection.events.recv() => match event {
                Some(LinkEvent::Sent(pkid)) => in_flight.sent(pkid),
                Some(LinkEvent::Acked(pkid)) => in_flight.acked(pkid),
                Some(LinkEvent::Closed) => return Ended::Closed,
                Some(LinkEvent::Lost(reason)) => return Ended::Lost(reason),
                None => return Ended::Lost("event loop stopped".to_string()),
            },
        }
    }
}

/// Reconnect after link loss; `None` once stopped.
async fn reconnect(
    ctx: &SessionContext,
    mut index: usize,
    stop: &mut watch::Receiver<bool>,
) -> Option<Connection> {
    let settings = ctx.settings();
    let attempts = settings.reconnect_attempts.max(1);
    let mut failures = 0;

    loop {
        if *stop.borrow() {
            return None;
        }
        tokio::select! {
            _ = tokio::time::sleep(settings.retry_interval) => {}
            _ = stop.changed() => return None,
        }

        let broker = ctx.broker(index)?.to_string();
        let opened = tokio::select! {
            opened = open(ctx, index) => opened,
            _ = stop.changed() => return None,
        };

        match opened {
            Ok(connection) => {
                tracing::info!(broker = %broker, "Reconnected to broker");
                return Some(connection);
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(broker = %broker, attempt = failures, error = %e, "Reconnect failed");
                if failures >= attempts && ctx.brokers.len() > 1 {
                    index = (index + 1) % ctx.brokers.len();
                    failures = 0;
                    if let Some(next) = ctx.broker(index) {
                        tracing::info!(broker = %next, "Failing over to next broker");
                    }
                }
            }
        }
    }
}
