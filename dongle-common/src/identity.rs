//! Dongle and device identities.
//!
//! Identities are opaque strings that scope broker topics. They are resolved
//! once at process start by [`Identity::from_options`], either from the
//! configuration or freshly generated, and passed explicitly to whatever
//! needs them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigMap;
use crate::error::{Error, Result};

/// Option key for a fixed dongle identity.
pub const DONGLE_ID_KEY: &str = "dongle_id";
/// Option key for a fixed device identity.
pub const DEVICE_ID_KEY: &str = "device_id";
/// Option key for the human-readable device model.
pub const DEVICE_TYPE_KEY: &str = "device_type";

fn validate(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentity(format!("{} cannot be empty", kind)));
    }
    if let Some(c) = value.chars().find(|c| matches!(c, '/' | '+' | '#')) {
        return Err(Error::InvalidIdentity(format!(
            "{} '{}' contains reserved character '{}'",
            kind, value, c
        )));
    }
    Ok(())
}

macro_rules! identity_type {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identity.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wrap an externally supplied identity.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

identity_type!(
    /// Identity of the bridge process (the dongle).
    DongleId,
    "dongle_id"
);

identity_type!(
    /// Identity of the device attached to the dongle.
    DeviceId,
    "device_id"
);

/// Descriptive information about the attached device.
///
/// Built once at startup; shared read-only with the middleware for registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: DeviceId,
    /// Model string, e.g. "Masimo Rad-8".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl DeviceDescriptor {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            device_type: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Identity of one bridge run: the dongle plus the device it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub dongle_id: DongleId,
    pub device: DeviceDescriptor,
}

impl Identity {
    pub fn new(dongle_id: DongleId, device: DeviceDescriptor) -> Self {
        Self { dongle_id, device }
    }

    /// Resolve identities from the options, generating any that are absent.
    ///
    /// `default_device_type` is used when `device_type` is not configured.
    pub fn from_options(options: &ConfigMap, default_device_type: Option<&str>) -> Result<Self> {
        let dongle_id = match options.get_non_empty(DONGLE_ID_KEY) {
            Some(id) => DongleId::new(id)?,
            None => DongleId::generate(),
        };
        let device_id = match options.get_non_empty(DEVICE_ID_KEY) {
            Some(id) => DeviceId::new(id)?,
            None => DeviceId::generate(),
        };

        let mut device = DeviceDescriptor::new(device_id);
        if let Some(device_type) = options.get_non_empty(DEVICE_TYPE_KEY).or(default_device_type) {
            device = device.with_device_type(device_type);
        }

        Ok(Self { dongle_id, device })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device.device_id
    }
}
