//! CLI argument parsing for bridges.

use std::path::PathBuf;

use clap::Parser;

use dongle_common::{LogFormat, LoggingConfig};

/// Common CLI arguments for all bridges.
#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Medical device to MQTT dongle bridge")]
pub struct BridgeArgs {
    /// Path to the configuration file.
    ///
    /// When omitted, the bridge's file name is looked up in the working
    /// directory, then the bundled default is used.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format (text, json).
    #[arg(long)]
    pub log_format: Option<LogFormat>,
}

impl BridgeArgs {
    /// Parse CLI arguments from the process command line.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Logging settings, falling back to `info` / text output.
    pub fn logging(&self) -> LoggingConfig {
        let defaults = LoggingConfig::default();
        LoggingConfig {
            level: self.log_level.clone().unwrap_or(defaults.level),
            format: self.log_format.unwrap_or(defaults.format),
        }
    }
}
