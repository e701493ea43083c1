//! Interpretation of the broker-related options.
//!
//! The loader hands options over as raw strings; this is the one place where
//! they are typed and validated.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dongle_common::{ConfigMap, DEFAULT_PROJECT, PROJECT_NAME_KEY};

use crate::error::{BridgeError, Result};
use crate::middleware::{ConnectOverrides, Credentials, Qos};

pub const DEFAULT_BROKER: &str = "tcp://localhost:1883";
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_OUTBOX_CAPACITY: usize = 10_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;

/// Transport security of a broker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
        }
    }
}

/// A broker endpoint such as `ssl://broker.example.org:8883`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "tcp" | "mqtt" => Scheme::Tcp,
                    "ssl" | "tls" | "mqtts" => Scheme::Tls,
                    other => return Err(format!("unsupported scheme '{}'", other)),
                };
                (scheme, rest)
            }
            None => (Scheme::Tcp, s),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| "unterminated IPv6 address".to_string())?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(format!("unexpected '{}' after address", tail)),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err("missing host".to_string());
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{}'", p))?,
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "ssl",
        };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Paths to the TLS material.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Unlocks an encrypted PKCS#8 client key.
    pub key_password: Option<String>,
}

impl fmt::Debug for TlsFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsFiles")
            .field("ca_cert", &self.ca_cert)
            .field("client_cert", &self.client_cert)
            .field("client_key", &self.client_key)
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Typed broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    /// Primary broker first, then the fail-over list.
    pub brokers: Vec<BrokerAddress>,
    pub connection_timeout: Duration,
    pub retry_interval: Duration,
    pub alive_interval: Duration,
    pub qos: Qos,
    /// `None` disables periodic status reports.
    pub report_interval: Option<Duration>,
    /// Messages held while no broker accepts them; the oldest are evicted first.
    pub outbox_capacity: usize,
    /// Failed reconnects to one broker before moving to the next in the list.
    pub reconnect_attempts: u32,
    pub project_name: String,
    pub credentials: Option<Credentials>,
    pub tls: TlsFiles,
    pub db_dir: Option<PathBuf>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            brokers: vec![BrokerAddress {
                scheme: Scheme::Tcp,
                host: "localhost".to_string(),
                port: 1883,
            }],
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            qos: Qos::default(),
            report_interval: Some(DEFAULT_REPORT_INTERVAL),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            project_name: DEFAULT_PROJECT.to_string(),
            credentials: None,
            tls: TlsFiles::default(),
            db_dir: None,
        }
    }
}

impl MqttSettings {
    /// Build settings from the option map; absent keys take defaults.
    pub fn from_options(options: &ConfigMap) -> Result<Self> {
        let mut settings = Self::default();

        let primary = options.get_non_empty("broker").unwrap_or(DEFAULT_BROKER);
        let mut brokers = vec![parse_broker("broker", primary)?];
        if let Some(list) = options.get_non_empty("brokers") {
            for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let address = parse_broker("brokers", entry)?;
                if !brokers.contains(&address) {
                    brokers.push(address);
                }
            }
        }
        settings.brokers = brokers;

        if let Some(v) = options.get_non_empty("connection_timeout") {
            settings.connection_timeout = parse_positive_duration("connection_timeout", v)?;
        }
        if let Some(v) = options.get_non_empty("retry_interval") {
            settings.retry_interval = parse_positive_duration("retry_interval", v)?;
        }
        if let Some(v) = options.get_non_empty("alive_interval") {
            let interval = parse_duration("alive_interval", v)?;
            if interval < Duration::from_secs(1) {
                return Err(BridgeError::invalid_setting(
                    "alive_interval",
                    v,
                    "must be at least one second",
                ));
            }
            settings.alive_interval = interval;
        }
        if let Some(v) = options.get_non_empty("qos") {
            settings.qos = v.parse()?;
        }
        if let Some(v) = options.get_non_empty("report_interval") {
            let interval = parse_duration("report_interval", v)?;
            settings.report_interval = (!interval.is_zero()).then_some(interval);
        }
        if let Some(v) = options.get_non_empty("outbox_capacity") {
            settings.outbox_capacity = parse_positive("outbox_capacity", v)?;
        }
        if let Some(v) = options.get_non_empty("reconnect_attempts") {
            settings.reconnect_attempts = parse_positive("reconnect_attempts", v)?;
        }
        if let Some(v) = options.get_non_empty(PROJECT_NAME_KEY) {
            if v.contains(['+', '#']) {
                return Err(BridgeError::invalid_setting(
                    PROJECT_NAME_KEY,
                    v,
                    "must not contain MQTT wildcards",
                ));
            }
            settings.project_name = v.to_string();
        }

        settings.credentials = match (
            options.get_non_empty("username"),
            options.get("password"),
        ) {
            (Some(user), password) => Some(Credentials::new(user, password.unwrap_or_default())),
            (None, Some(password)) if !password.trim().is_empty() => {
                return Err(BridgeError::invalid_setting(
                    "password",
                    "<redacted>",
                    "password given without username",
                ));
            }
            (None, _) => None,
        };

        settings.tls = TlsFiles {
            ca_cert: options.get_non_empty("ca_cert_file").map(PathBuf::from),
            client_cert: options.get_non_empty("client_cert_file").map(PathBuf::from),
            client_key: options.get_non_empty("client_key_file").map(PathBuf::from),
            key_password: options.get("key_password").filter(|v| !v.is_empty()).map(String::from),
        };
        match (&settings.tls.client_cert, &settings.tls.client_key) {
            (Some(_), None) => {
                return Err(BridgeError::invalid_setting(
                    "client_key_file",
                    "",
                    "required when client_cert_file is set",
                ));
            }
            (None, Some(_)) => {
                return Err(BridgeError::invalid_setting(
                    "client_cert_file",
                    "",
                    "required when client_key_file is set",
                ));
            }
            (Some(_), Some(_)) if settings.tls.ca_cert.is_none() => {
                return Err(BridgeError::invalid_setting(
                    "ca_cert_file",
                    "",
                    "required when a client certificate is configured",
                ));
            }
            _ => {}
        }
        if settings.tls.key_password.is_some() && settings.tls.client_key.is_none() {
            return Err(BridgeError::invalid_setting(
                "key_password",
                "<redacted>",
                "given without client_key_file",
            ));
        }

        settings.db_dir = options.get_non_empty("db_dir").map(PathBuf::from);

        Ok(settings)
    }

    /// Brokers to try, in order, with the overrides applied to the primary.
    pub fn candidates(&self, overrides: &ConnectOverrides) -> Vec<BrokerAddress> {
        let mut brokers = self.brokers.clone();
        if let Some(primary) = brokers.first_mut() {
            if let Some(host) = &overrides.host {
                primary.host = host.clone();
            }
            if let Some(port) = overrides.port {
                primary.port = port;
            }
        }
        brokers
    }

    /// Whether any broker needs TLS.
    pub fn uses_tls(&self) -> bool {
        self.brokers.iter().any(|b| b.scheme == Scheme::Tls)
    }
}

fn parse_broker(key: &str, value: &str) -> Result<BrokerAddress> {
    value
        .parse()
        .map_err(|reason| BridgeError::invalid_setting(key, value, reason))
}

/// A bare integer is seconds; anything else is a humantime expression.
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| BridgeError::invalid_setting(key, value, e.to_string()))
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr + Default + PartialEq,
{
    match value.trim().parse::<T>() {
        Ok(n) if n != T::default() => Ok(n),
        Ok(_) => Err(BridgeError::invalid_setting(key, value, "must be greater than zero")),
        Err(_) => Err(BridgeError::invalid_setting(key, value, "expected a positive integer")),
    }
}

fn parse_positive_duration(key: &str, value: &str) -> Result<Duration> {
    let duration = parse_duration(key, value)?;
    if duration.is_zero() {
        return Err(BridgeError::invalid_setting(key, value, "must be greater than zero"));
    }
    Ok(duration)
}
