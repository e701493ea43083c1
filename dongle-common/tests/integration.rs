//! Integration tests for dongle-common library.

use std::fs;

use tempfile::TempDir;

use dongle_common::{
    Clock, ConfigLoader, ConfigSource, DataEnvelope, DeviceId, Error, FixedClock, Identity,
    TopicBuilder, format_local,
};

const PROPERTIES: &str = "\
# bedside dongle
device_port = /dev/ttyUSB0
dongle_id = icu-bed-4
device_type = Masimo Rad-8
project_name = ICU
broker = ssl://broker.example.org:8883
brokers = ssl://backup1:8883,ssl://backup2:8883
qos = 1
report_interval = 60
";

#[test]
fn test_config_to_topics_workflow() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("masimo.properties"), PROPERTIES).unwrap();

    let loaded = ConfigLoader::new("masimo.properties")
        .load_from_dir(dir.path())
        .expect("config should load");
    assert_eq!(
        loaded.source,
        ConfigSource::File(dir.path().join("masimo.properties"))
    );

    // Exactly the keys present in the file, values uncoerced.
    let keys: Vec<_> = loaded.options.keys().collect();
    assert_eq!(
        keys,
        vec![
            "broker",
            "brokers",
            "device_port",
            "device_type",
            "dongle_id",
            "project_name",
            "qos",
            "report_interval",
        ]
    );
    assert_eq!(
        loaded.options.get("brokers"),
        Some("ssl://backup1:8883,ssl://backup2:8883")
    );

    let identity = Identity::from_options(&loaded.options, None).unwrap();
    assert_eq!(identity.dongle_id.as_str(), "icu-bed-4");
    assert_eq!(identity.device.device_type.as_deref(), Some("Masimo Rad-8"));

    // The device id was generated; the map is left untouched.
    assert!(!loaded.options.contains_key("device_id"));

    let topics = TopicBuilder::new(
        loaded.options.get("project_name").unwrap(),
        identity.dongle_id.clone(),
    );
    assert_eq!(
        topics.data(identity.device_id()),
        format!("ICU/data/icu-bed-4/{}", identity.device_id())
    );
    assert_eq!(topics.status(), "ICU/status/icu-bed-4");
}

#[test]
fn test_envelope_from_clock_reading() {
    let clock = FixedClock::from_millis(1_700_000_000_123);
    let instant = clock.now();

    let envelope = DataEnvelope::at(instant, "SpO2:98 PR:75");
    let json: serde_json::Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();

    assert_eq!(json["epoch"], 1_700_000_000_123_i64);
    assert_eq!(json["data"], "SpO2:98 PR:75");
    assert_eq!(json["time"], format_local(instant));
}

#[test]
fn test_missing_config_everywhere() {
    let dir = TempDir::new().unwrap();

    let err = ConfigLoader::new("masimo.properties")
        .load_from_dir(dir.path())
        .unwrap_err();

    assert!(matches!(err, Error::ConfigMissing { ref file } if file == "masimo.properties"));
}

#[test]
fn test_identity_rejects_topic_separators() {
    for bad in ["bed/4", "bed+", "#"] {
        assert!(DeviceId::new(bad).is_err(), "{} should be rejected", bad);
    }
}
