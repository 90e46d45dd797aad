//! mmWave sensor reading and upstream message decoding.
//!
//! The ESP32 publishes one JSON object per message:
//! `{"presence": true, "motion": false, "distance": 120}`. Boolean fields are
//! accepted in a few loose encodings because firmware revisions disagree on
//! them; unknown fields are ignored.

use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, de};
use serde_json::Value;

/// One observation from the presence sensor.
///
/// Immutable once constructed; the relay swaps whole readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    presence: bool,
    motion: bool,
    distance_cm: u32,
    observed_at: DateTime<Utc>,
}

impl SensorReading {
    pub fn new(presence: bool, motion: bool, distance_cm: u32, observed_at: DateTime<Utc>) -> Self {
        Self {
            presence,
            motion,
            distance_cm,
            observed_at,
        }
    }

    /// Decode one upstream message, stamping it with `observed_at`.
    pub fn decode(raw: &str, observed_at: DateTime<Utc>) -> Result<Self> {
        let wire: WireReading = serde_json::from_str(raw.trim())
            .map_err(|e| RelayError::MalformedMessage(e.to_string()))?;
        Ok(Self::new(
            wire.presence,
            wire.motion,
            wire.distance,
            observed_at,
        ))
    }

    pub fn presence(&self) -> bool {
        self.presence
    }

    pub fn motion(&self) -> bool {
        self.motion
    }

    pub fn distance_cm(&self) -> u32 {
        self.distance_cm
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

#[derive(Deserialize)]
struct WireReading {
    #[serde(deserialize_with = "bool_like")]
    presence: bool,
    #[serde(deserialize_with = "bool_like")]
    motion: bool,
    #[serde(deserialize_with = "distance_cm")]
    distance: u32,
}

fn bool_like<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => n
            .as_f64()
            .map(|f| f != 0.0)
            .ok_or_else(|| de::Error::custom("invalid number")),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "yes" => Ok(true),
            "false" | "0" | "off" | "no" => Ok(false),
            other => Err(de::Error::custom(format!("not a boolean: {:?}", other))),
        },
        other => Err(de::Error::custom(format!("not a boolean: {}", other))),
    }
}

fn distance_cm<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let cm = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| de::Error::custom(format!("distance is not a number: {}", value)))?;

    if !cm.is_finite() || cm < 0.0 || cm > u32::MAX as f64 {
        return Err(de::Error::custom(format!("distance out of range: {}", cm)));
    }
    Ok(cm.round() as u32)
}
