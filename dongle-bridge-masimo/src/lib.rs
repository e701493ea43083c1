//! Dongle bridge for the Masimo Rad-8 pulse oximeter.
//!
//! Reads the oximeter's serial output line by line and publishes every record,
//! wrapped in a timestamped envelope, to the dongle's MQTT data topic.
//!
//! # Topics
//!
//! ```text
//! <project>/data/<dongle_id>/<device_id>
//! ```
//!
//! Where:
//! - `<project>` - `project_name` option (default `DEFAULT`)
//! - `<dongle_id>` / `<device_id>` - configured or generated per run

pub mod config;
pub mod driver;

use dongle_bridge_framework::BridgeInfo;

pub use config::{LineSettings, SerialSettings, resolve_port};
pub use driver::{MasimoDriver, MasimoDriverFactory};

/// Configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "masimo.properties";

/// Configuration used when no file is found.
pub const BUNDLED_CONFIG: &str = include_str!("../config/masimo.properties");

pub const DEFAULT_DEVICE_TYPE: &str = "Masimo Rad-8";

pub const BRIDGE: BridgeInfo = BridgeInfo {
    name: "masimo",
    config_file: CONFIG_FILE,
    bundled_config: Some(BUNDLED_CONFIG),
    default_device_type: Some(DEFAULT_DEVICE_TYPE),
};
