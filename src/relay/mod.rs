//! Sensor-state relay: one upstream reading fanned out to many viewers.
//!
//! - `state`: latest reading plus connectivity flag
//! - `registry`: attached subscribers
//! - `broadcaster`: delivery pass over a registry snapshot
//! - `hub`: the coordinator tying the three together

pub mod broadcaster;
pub mod hub;
pub mod registry;
pub mod state;

pub use broadcaster::{BroadcastReport, BroadcastStats, Broadcaster};
pub use hub::{DEFAULT_SUBSCRIBER_QUEUE, Relay};
pub use registry::{StateMessage, Subscriber, SubscriberId, SubscriberRegistry};
pub use state::{RelayState, StatePayload};
