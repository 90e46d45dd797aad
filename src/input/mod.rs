//! Upstream input for the relay.
//!
//! - `source`: transports that yield raw sensor messages
//! - `link`: the reconnecting sensor link feeding the relay
//! - `simulation`: a fake ESP32 feed for development without hardware

pub mod link;
pub mod simulation;
pub mod source;

pub use link::{LinkState, SensorLink};
pub use source::{LineSource, UpstreamSource, WebSocketSource};
