//! Latest-known relay state and its downstream wire form.

use crate::sensors::SensorReading;
use chrono::SecondsFormat;
use serde::Serialize;

/// Latest reading plus upstream connectivity.
///
/// Losing the upstream link only flips `upstream_connected`; `latest` is kept
/// so viewers see the last good reading alongside the flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayState {
    latest: Option<SensorReading>,
    upstream_connected: bool,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&SensorReading> {
        self.latest.as_ref()
    }

    pub fn upstream_connected(&self) -> bool {
        self.upstream_connected
    }

    /// Replace the latest reading. A reading implies a live upstream.
    pub fn record(&mut self, reading: SensorReading) {
        self.latest = Some(reading);
        self.upstream_connected = true;
    }

    /// Set the connectivity flag, returning whether it changed.
    pub fn set_connected(&mut self, connected: bool) -> bool {
        let changed = self.upstream_connected != connected;
        self.upstream_connected = connected;
        changed
    }

    pub fn payload(&self) -> StatePayload {
        match &self.latest {
            Some(reading) => StatePayload {
                presence: reading.presence(),
                motion: reading.motion(),
                distance: reading.distance_cm(),
                timestamp: Some(
                    reading
                        .observed_at()
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
                connected: self.upstream_connected,
            },
            None => StatePayload {
                presence: false,
                motion: false,
                distance: 0,
                timestamp: None,
                connected: self.upstream_connected,
            },
        }
    }

    /// Serialize the state as the JSON text sent to every subscriber.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.payload())
    }
}

/// Downstream message: `{"presence", "motion", "distance", "timestamp", "connected"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatePayload {
    pub presence: bool,
    pub motion: bool,
    pub distance: u32,
    pub timestamp: Option<String>,
    pub connected: bool,
}
