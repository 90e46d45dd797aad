//! Sensor data model.
//!
//! Readings decoded from the upstream mmWave feed, consumed by the relay.

pub mod reading;

pub use reading::SensorReading;
