//! types/heartrate.rs
//!
//! Defines the HeartRateSample handed to the relay by the sensor-acquisition
//! side, and the record shape stored in the remote append log.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// One heart-rate reading. Immutable once created.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedSample")]
pub struct HeartRateSample {
    /// Beats per minute, always finite and positive.
    value: f64,
    /// Unix timestamp, whole seconds.
    captured_at: i64,
}

#[derive(Deserialize)]
struct UncheckedSample {
    value: f64,
    captured_at: i64,
}

impl TryFrom<UncheckedSample> for HeartRateSample {
    type Error = RelayError;

    fn try_from(raw: UncheckedSample) -> Result<Self, Self::Error> {
        Self::new(raw.value, raw.captured_at)
    }
}

impl HeartRateSample {
    pub fn new(value: f64, captured_at: i64) -> Result<Self, RelayError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(RelayError::InvalidSample(format!(
                "heart rate must be a positive number of bpm, got {}",
                value
            )));
        }
        Ok(Self { value, captured_at })
    }

    /// Sample stamped with the current wall-clock time.
    pub fn now(value: f64) -> Result<Self, RelayError> {
        Self::new(value, Utc::now().timestamp())
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    pub fn captured_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.captured_at, 0).single()
    }
}

/// Stored form of a sample: `sessions/{id}/heartRate/{key}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartRateRecord {
    #[serde(rename = "heartRate")]
    pub heart_rate: f64,
    pub timestamp: i64,
}

impl From<HeartRateSample> for HeartRateRecord {
    fn from(sample: HeartRateSample) -> Self {
        Self {
            heart_rate: sample.value,
            timestamp: sample.captured_at,
        }
    }
}
