//! Epoch-second timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in time as floating epoch seconds.
///
/// Stored as a bare `f64` so snapshots and history lines round-trip exactly
/// through JSON.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// From raw epoch seconds.
    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    /// From a chrono datetime, truncated to microseconds.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros() as f64 / 1_000_000.0)
    }

    /// Raw epoch seconds.
    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Convert to a chrono datetime. `None` if out of chrono's range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if !self.0.is_finite() {
            return None;
        }
        let secs = self.0.floor();
        let nanos = ((self.0 - secs) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
        DateTime::from_timestamp(secs as i64, nanos)
    }

    /// Seconds elapsed since `earlier` (negative if `earlier` is later).
    pub fn seconds_since(self, earlier: Timestamp) -> f64 {
        self.0 - earlier.0
    }

    /// Shift by a number of seconds.
    pub fn offset(self, secs: f64) -> Self {
        Self(self.0 + secs)
    }

    /// The later of two timestamps.
    pub fn max(self, other: Timestamp) -> Self {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }

    pub(crate) fn is_finite(self) -> bool {
        self.0.is_finite()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}", self.0),
        }
    }
}
