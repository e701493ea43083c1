use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Format of [`DataEnvelope::time`], rendered in local time.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Timestamped wrapper published for every text reading.
///
/// Serializes as `{"time": "...", "epoch": <millis>, "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEnvelope {
    /// Local wall-clock time with millisecond precision.
    pub time: String,
    /// Milliseconds since the Unix epoch.
    pub epoch: i64,
    /// Raw device payload, verbatim.
    pub data: String,
}

impl DataEnvelope {
    /// Wrap `data` using a single clock reading for both time fields.
    pub fn at(instant: DateTime<Utc>, data: impl Into<String>) -> Self {
        Self {
            time: format_local(instant),
            epoch: instant.timestamp_millis(),
            data: data.into(),
        }
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Render an instant in local time using [`TIME_FORMAT`].
pub fn format_local(instant: DateTime<Utc>) -> String {
    instant.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

/// Source of wall-clock readings.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Clock frozen at `millis` since the epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    pub fn from_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
