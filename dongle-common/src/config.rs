//! Key/value configuration loading.
//!
//! A dongle is configured by a flat `key=value` file (Java-properties style).
//! The loader resolves the file, parses it into an immutable [`ConfigMap`] and
//! checks that the physical endpoint ([`DEVICE_PORT_KEY`]) is present. Every
//! other key is passed through untouched for the collaborators to interpret.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use ini::{Ini, ParseOption};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Mandatory key naming the physical device endpoint.
pub const DEVICE_PORT_KEY: &str = "device_port";

/// Immutable option map loaded once at startup.
///
/// Cloning is cheap; all clones share the same entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMap {
    entries: Arc<BTreeMap<String, String>>,
}

impl ConfigMap {
    /// Build a map from key/value pairs. Later duplicates win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Parse `key=value` (or `key: value`) lines.
    ///
    /// Only section-less keys are kept; comment lines start with `#` or `;`.
    /// Quotes and backslashes are part of the value.
    pub fn parse(content: &str) -> Result<Self> {
        let verbatim = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(content, verbatim)?;
        let pairs = ini
            .general_section()
            .iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()));
        Ok(Self::from_pairs(pairs))
    }

    /// Raw string value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Value for a key, treating blank values as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Value for a mandatory key.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get_non_empty(key)
            .ok_or_else(|| Error::ConfigInvalid(format!("missing required option '{}'", key)))
    }

    /// Whether the key is present (blank or not).
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The physical device endpoint.
    pub fn device_port(&self) -> Result<&str> {
        self.require(DEVICE_PORT_KEY)
    }
}

/// Where a configuration was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A file on disk.
    File(PathBuf),
    /// The default compiled into the binary.
    Bundled,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Bundled => write!(f, "bundled default"),
        }
    }
}

/// Result of a successful configuration load.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub source: ConfigSource,
    pub options: ConfigMap,
}

/// Locates and parses the dongle configuration file.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file_name: String,
    bundled: Option<&'static str>,
}

impl ConfigLoader {
    /// Create a loader for the given file name (e.g. `masimo.properties`).
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            bundled: None,
        }
    }

    /// Fall back to `content` when the file is not in the working directory.
    pub fn with_bundled_default(mut self, content: &'static str) -> Self {
        self.bundled = Some(content);
        self
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Load from `dir/<file name>`, falling back to the bundled default.
    pub fn load_from_dir(&self, dir: impl AsRef<Path>) -> Result<LoadedConfig> {
        let path = dir.as_ref().join(&self.file_name);

        if path.is_file() {
            return self.load_file(&path);
        }

        match self.bundled {
            Some(content) => {
                tracing::info!(file = %self.file_name, "Loading configuration from bundled default");
                self.finish(ConfigSource::Bundled, content)
            }
            None => Err(Error::ConfigMissing {
                file: self.file_name.clone(),
            }),
        }
    }

    /// Load from an explicit path. No fallback applies.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<LoadedConfig> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::ConfigMissing {
                file: path.display().to_string(),
            });
        }

        tracing::info!(path = %path.display(), "Loading configuration");
        let content = std::fs::read_to_string(path)?;
        self.finish(ConfigSource::File(path.to_path_buf()), &content)
    }

    fn finish(&self, source: ConfigSource, content: &str) -> Result<LoadedConfig> {
        let options = ConfigMap::parse(content)?;
        let port = options.device_port()?;
        tracing::info!(device_port = %port, options = options.len(), "Configuration loaded");
        Ok(LoadedConfig { source, options })
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::ConfigInvalid(format!(
                "unknown log format '{}' (use text or json)",
                other
            ))),
        }
    }
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
