//! Dongle Bridge Framework
//!
//! Orchestration for bridges that read one medical device and republish its
//! readings to an MQTT broker.
//!
//! # Overview
//!
//! This framework provides:
//! - [`Middleware`] and [`Driver`] capability traits for the broker and device collaborators
//! - [`MqttMiddleware`], the broker collaborator backed by `rumqttc`
//! - [`BridgeOrchestrator`] for startup sequencing and data-path wiring
//! - [`DataPath`], the driver callback that wraps readings in envelopes and publishes them
//! - [`ShutdownCoordinator`] for releasing the broker link exactly once
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`run_bridge`] to drive a bridge process end to end
//!
//! # Example
//!
//! ```ignore
//! use dongle_bridge_framework::{BridgeInfo, run_bridge};
//!
//! const BRIDGE: BridgeInfo = BridgeInfo {
//!     name: "mydevice",
//!     config_file: "mydevice.properties",
//!     bundled_config: None,
//!     default_device_type: Some("My Device"),
//! };
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     run_bridge(BRIDGE, |_| Ok(Box::new(MyDriverFactory))).await
//! }
//! ```

mod args;
mod driver;
mod error;
mod middleware;
pub mod mqtt;
mod orchestrator;
mod pipeline;
mod runner;
mod shutdown;
mod status;

pub use args::BridgeArgs;
pub use driver::{Driver, DriverCallback, DriverFactory, DriverMessage, Subscription};
pub use error::{BridgeError, Result};
pub use middleware::{ConnectOverrides, ConnectionState, Credentials, Middleware, Qos};
pub use mqtt::{MqttMiddleware, MqttSettings};
pub use orchestrator::BridgeOrchestrator;
pub use pipeline::{DataPath, PipelineStats};
pub use runner::{BridgeInfo, FAILURE_EXIT_CODE, launch, launch_with, run_bridge};
pub use shutdown::{DEFAULT_DISCONNECT_TIMEOUT, ShutdownCoordinator, TerminationSignal};
pub use status::{BridgeStatus, StatusState};

// Re-export commonly used types from dongle-common
pub use dongle_common::{
    Clock, ConfigMap, DataEnvelope, DeviceDescriptor, DeviceId, DongleId, FixedClock, Identity,
    LogFormat, LoggingConfig, SystemClock,
};
