//! Serial line configuration for the Rad-8.

use dongle_bridge_framework::{BridgeError, ConfigMap, Result};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilder, SerialStream, StopBits};

/// Rad-8 serial output default.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Line parameters shared by every port the factory opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for LineSettings {
    /// 9600 baud, 8N1.
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl LineSettings {
    /// Read `baud_rate`, `data_bits`, `parity` and `stop_bits`, defaulting to 8N1 at 9600.
    pub fn from_options(options: &ConfigMap) -> Result<Self> {
        let mut line = Self::default();

        if let Some(v) = options.get_non_empty("baud_rate") {
            line.baud_rate = v
                .parse::<u32>()
                .ok()
                .filter(|b| *b > 0)
                .ok_or_else(|| BridgeError::invalid_setting("baud_rate", v, "expected a positive integer"))?;
        }

        if let Some(v) = options.get_non_empty("data_bits") {
            line.data_bits = match v {
                "5" => DataBits::Five,
                "6" => DataBits::Six,
                "7" => DataBits::Seven,
                "8" => DataBits::Eight,
                _ => return Err(BridgeError::invalid_setting("data_bits", v, "use 5, 6, 7 or 8")),
            };
        }

        if let Some(v) = options.get_non_empty("parity") {
            line.parity = match v.to_lowercase().as_str() {
                "none" => Parity::None,
                "even" => Parity::Even,
                "odd" => Parity::Odd,
                _ => {
                    return Err(BridgeError::invalid_setting(
                        "parity",
                        v,
                        "use none, even, or odd",
                    ));
                }
            };
        }

        if let Some(v) = options.get_non_empty("stop_bits") {
            line.stop_bits = match v {
                "1" => StopBits::One,
                "2" => StopBits::Two,
                _ => return Err(BridgeError::invalid_setting("stop_bits", v, "use 1 or 2")),
            };
        }

        Ok(line)
    }
}

/// A serial port path plus its line settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub line: LineSettings,
}

impl SerialSettings {
    /// Settings for `endpoint`, resolved with [`resolve_port`].
    pub fn new(endpoint: &str, line: LineSettings) -> Self {
        Self {
            port: resolve_port(endpoint),
            line,
        }
    }

    fn builder(&self) -> SerialPortBuilder {
        tokio_serial::new(&self.port, self.line.baud_rate)
            .data_bits(self.line.data_bits)
            .parity(self.line.parity)
            .stop_bits(self.line.stop_bits)
            .flow_control(FlowControl::None)
    }

    pub fn open(&self) -> std::result::Result<SerialStream, tokio_serial::Error> {
        SerialStream::open(&self.builder())
    }
}

/// Resolve a configured endpoint to a port path.
///
/// On Unix a bare device name (`ttyUSB0`) lives under `/dev`. Paths and
/// Windows port names (`COM3`) are used as given.
pub fn resolve_port(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if cfg!(unix) && !endpoint.contains('/') {
        format!("/dev/{}", endpoint)
    } else {
        endpoint.to_string()
    }
}
