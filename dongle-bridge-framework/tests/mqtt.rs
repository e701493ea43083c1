//! MQTT middleware against a scripted broker on a loopback port.

mod support;

use std::time::{Duration, Instant};

use tokio_test::assert_ok;

use dongle_bridge_framework::{
    BridgeError, ConnectOverrides, ConnectionState, Middleware, MqttMiddleware, Qos,
};
use dongle_common::{ConfigMap, DeviceDescriptor, DeviceId, DongleId};

use support::broker::{FakeBroker, Mode};

const DATA_TOPIC: &str = "icu/data/dongle-e2e/rad8";
const DEVICE_TOPIC: &str = "icu/device/dongle-e2e/rad8";
const STATUS_TOPIC: &str = "icu/status/dongle-e2e";

fn middleware(pairs: &[(&str, &str)]) -> MqttMiddleware {
    let mqtt = MqttMiddleware::new(DongleId::new("dongle-e2e").unwrap());
    let mut options = vec![
        ("project_name", "icu"),
        ("qos", "1"),
        ("report_interval", "0s"),
        ("connection_timeout", "2s"),
    ];
    options.extend_from_slice(pairs);
    mqtt.init(&ConfigMap::from_pairs(options)).unwrap();
    mqtt
}

fn rad8() -> DeviceId {
    DeviceId::new("rad8").unwrap()
}

async fn wait_for_state(mqtt: &MqttMiddleware, wanted: ConnectionState) {
    let mut state = mqtt.state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_session_publishes_and_releases() {
    let broker = FakeBroker::start().await;
    let mqtt = middleware(&[("broker", broker.url().as_str())]);

    assert_ok!(mqtt.connect(ConnectOverrides::default()).await);
    assert_eq!(*mqtt.state().borrow(), ConnectionState::Connected);

    let connects = broker.connects();
    let connect = &connects[0];
    assert_eq!(connect.client_id, "dongle-e2e");
    assert!(connect.clean_session);
    assert_eq!(connect.will_topic.as_deref(), Some(STATUS_TOPIC));
    assert!(connect.will_retain);
    let will: serde_json::Value =
        serde_json::from_slice(connect.will_payload.as_ref().unwrap()).unwrap();
    assert_eq!(will["status"], "offline");

    let descriptor = DeviceDescriptor::new(rad8()).with_device_type("Masimo Rad-8");
    assert_ok!(mqtt.add_device(&descriptor).await);
    assert_ok!(mqtt.publish_id(&rad8(), br#"{"spo2":97}"#.to_vec(), None).await);
    assert_ok!(
        mqtt.publish_id(&rad8(), br#"{"spo2":98}"#.to_vec(), Some(Qos::AtMostOnce))
            .await
    );

    assert!(
        broker
            .wait_until(Duration::from_secs(5), |b| b.published_to(DATA_TOPIC).len() == 2)
            .await
    );
    let data = broker.published_to(DATA_TOPIC);
    assert_eq!(data[0].payload, br#"{"spo2":97}"#);
    assert_eq!((data[0].qos, data[0].retain), (1, false));
    assert_eq!((data[1].qos, data[1].retain), (0, false));

    let device = broker.published_to(DEVICE_TOPIC);
    assert!(!device.is_empty());
    assert!(device.iter().all(|p| p.retain && p.qos == 1));
    assert_eq!(device[0].json()["device_type"], "Masimo Rad-8");

    let status = broker.published_to(STATUS_TOPIC);
    assert!(status.iter().all(|p| p.retain));
    assert_eq!(status[0].json()["status"], "running");

    assert_ok!(mqtt.disconnect().await);
    assert!(broker.wait_until(Duration::from_secs(2), |b| b.disconnects() == 1).await);
    let last = broker.published_to(STATUS_TOPIC).pop().unwrap();
    assert_eq!(last.json()["status"], "offline");
    assert!(last.retain);
    assert_eq!(*mqtt.state().borrow(), ConnectionState::Disconnected);
    assert_eq!(mqtt.pending(), 0);

    let err = mqtt.publish_id(&rad8(), b"{}".to_vec(), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::NotConnected));
}

#[tokio::test]
async fn test_outage_keeps_samples_until_reconnect() {
    let broker = FakeBroker::start().await;
    let mqtt = middleware(&[("broker", broker.url().as_str()), ("retry_interval", "100ms")]);

    assert_ok!(mqtt.connect(ConnectOverrides::default()).await);
    assert!(
        broker
            .wait_until(Duration::from_secs(5), |b| !b.published_to(STATUS_TOPIC).is_empty())
            .await
    );

    broker.set_mode(Mode::Down);
    wait_for_state(&mqtt, ConnectionState::Retrying).await;

    let started = Instant::now();
    for n in 0..120 {
        let payload = format!(r#"{{"n":{}}}"#, n).into_bytes();
        let accepted =
            tokio::time::timeout(Duration::from_millis(200), mqtt.publish_id(&rad8(), payload, None))
                .await;
        assert!(matches!(accepted, Ok(Ok(()))), "sample {} not accepted", n);
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(mqtt.pending() >= 120);
    assert!(broker.published_to(DATA_TOPIC).is_empty());

    broker.set_mode(Mode::Up);
    assert!(
        broker
            .wait_until(Duration::from_secs(10), |b| b.published_to(DATA_TOPIC).len() >= 120)
            .await
    );
    let received: Vec<u64> = broker
        .published_to(DATA_TOPIC)
        .iter()
        .map(|p| p.json()["n"].as_u64().unwrap())
        .collect();
    assert_eq!(received, (0..120).collect::<Vec<u64>>());

    assert_eq!(*mqtt.state().borrow(), ConnectionState::Connected);
    assert!(broker.connects().len() >= 2);
    assert!(broker.published_to(STATUS_TOPIC).len() >= 2);

    assert_ok!(mqtt.disconnect().await);
}

#[tokio::test]
async fn test_fails_over_when_broker_stays_down() {
    let primary = FakeBroker::start().await;
    let backup = FakeBroker::start().await;
    let mqtt = middleware(&[
        ("broker", primary.url().as_str()),
        ("brokers", backup.url().as_str()),
        ("retry_interval", "50ms"),
        ("reconnect_attempts", "2"),
    ]);

    assert_ok!(mqtt.connect(ConnectOverrides::default()).await);
    assert_ok!(mqtt.add_device(&DeviceDescriptor::new(rad8())).await);
    assert!(
        primary
            .wait_until(Duration::from_secs(5), |b| !b.published_to(DEVICE_TOPIC).is_empty())
            .await
    );
    assert!(backup.connects().is_empty());

    primary.set_mode(Mode::Down);
    wait_for_state(&mqtt, ConnectionState::Retrying).await;
    assert_ok!(mqtt.publish_id(&rad8(), br#"{"spo2":95}"#.to_vec(), None).await);

    assert!(
        backup
            .wait_until(Duration::from_secs(10), |b| !b.published_to(DATA_TOPIC).is_empty())
            .await
    );
    assert_eq!(backup.published_to(DATA_TOPIC)[0].payload, br#"{"spo2":95}"#);
    assert_eq!(backup.connects().len(), 1);

    let device = backup.published_to(DEVICE_TOPIC);
    assert!(device[0].retain);
    assert_eq!(device[0].json()["device_id"], "rad8");
    let status = backup.published_to(STATUS_TOPIC);
    assert_eq!(status[0].json()["status"], "running");
    assert_eq!(status[0].json()["devices"][0], "rad8");

    assert_ok!(mqtt.disconnect().await);
    assert!(backup.wait_until(Duration::from_secs(2), |b| b.disconnects() == 1).await);
}

#[tokio::test]
async fn test_silent_broker_times_out() {
    let broker = FakeBroker::start().await;
    broker.set_mode(Mode::Silent);
    let mqtt = middleware(&[("broker", broker.url().as_str()), ("connection_timeout", "1s")]);

    let started = Instant::now();
    let err = mqtt
        .connect(ConnectOverrides::default())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(4));
    // Either bound may fire first; both report a timeout.
    let message = err.to_string().to_lowercase();
    assert!(message.contains("timed out") || message.contains("timeout"), "{}", message);
    assert_eq!(broker.connects().len(), 1);
    assert_eq!(*mqtt.state().borrow(), ConnectionState::Disconnected);
}
