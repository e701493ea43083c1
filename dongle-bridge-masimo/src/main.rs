//! Dongle bridge for the Masimo Rad-8 pulse oximeter.
//!
//! Reads the oximeter's serial output and publishes each record to MQTT.

use std::process::ExitCode;

use dongle_bridge_framework::{DriverFactory, run_bridge};
use dongle_bridge_masimo::{BRIDGE, MasimoDriverFactory};

#[tokio::main]
async fn main() -> ExitCode {
    run_bridge(BRIDGE, |options| {
        let factory = MasimoDriverFactory::from_options(options)?;
        Ok(Box::new(factory) as Box<dyn DriverFactory>)
    })
    .await
}
