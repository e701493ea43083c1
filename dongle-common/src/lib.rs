//! Dongle Common Library
//!
//! This crate provides shared types and utilities for medical device dongle bridges:
//!
//! - [`config`] - Key/value configuration loading (`ConfigLoader`, `ConfigMap`)
//! - [`identity`] - Dongle/device identities and the device descriptor
//! - [`envelope`] - Timestamped data envelope and clock abstraction
//! - [`topic`] - Broker topic builder
//! - [`error`] - Error types

pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod topic;

// Re-export commonly used types at the crate root
pub use config::{
    ConfigLoader, ConfigMap, ConfigSource, DEVICE_PORT_KEY, LoadedConfig, LogFormat,
    LoggingConfig,
};
pub use envelope::{Clock, DataEnvelope, FixedClock, SystemClock, TIME_FORMAT, format_local};
pub use error::{Error, Result};
pub use identity::{DeviceDescriptor, DeviceId, DongleId, Identity};
pub use topic::{DEFAULT_PROJECT, PROJECT_NAME_KEY, TopicBuilder};

/// Install the process-wide log subscriber.
///
/// `RUST_LOG` wins over `config.level` when it is set. JSON records carry
/// the current span. A second call fails with [`Error::Tracing`].
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}
