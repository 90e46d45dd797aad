//! Relay coordinator owning the shared state and the subscriber set.
//!
//! The sensor link writes through [`Relay::publish_reading`] and
//! [`Relay::set_upstream_connected`]; connection tasks attach and detach
//! through [`Relay::subscribe`] and [`Relay::detach`]. State updates, their
//! broadcast and catch-up sends all happen under one lock, so every
//! subscriber sees broadcasts in the order the triggering events occurred.

use super::broadcaster::{BroadcastReport, BroadcastStats, Broadcaster};
use super::registry::{StateMessage, Subscriber, SubscriberId, SubscriberRegistry};
use super::state::RelayState;
use crate::error::Result;
use crate::sensors::SensorReading;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Default outbound queue depth per subscriber.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 32;

struct RelayInner {
    state: RelayState,
    registry: SubscriberRegistry,
}

pub struct Relay {
    inner: Mutex<RelayInner>,
    broadcaster: Broadcaster,
    next_subscriber_id: AtomicU64,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RelayInner {
                state: RelayState::new(),
                registry: SubscriberRegistry::new(),
            }),
            broadcaster: Broadcaster::new(),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> RelayState {
        self.inner.lock().state
    }

    /// Record a freshly decoded reading and broadcast it.
    pub fn publish_reading(&self, reading: SensorReading) -> Result<BroadcastReport> {
        let mut inner = self.inner.lock();
        let RelayInner { state, registry } = &mut *inner;
        state.record(reading);
        self.broadcaster.broadcast(state, registry)
    }

    /// Update upstream connectivity and broadcast, even if the flag is unchanged.
    pub fn set_upstream_connected(&self, connected: bool) -> Result<BroadcastReport> {
        let mut inner = self.inner.lock();
        let RelayInner { state, registry } = &mut *inner;
        if state.set_connected(connected) {
            info!(
                "[Relay] Upstream {}",
                if connected { "connected" } else { "disconnected" }
            );
        }
        self.broadcaster.broadcast(state, registry)
    }

    /// Allocate a subscriber, attach it and return its queue.
    ///
    /// The current state is the first message in the queue.
    pub fn subscribe(
        &self,
        capacity: usize,
    ) -> Result<(SubscriberId, mpsc::Receiver<StateMessage>)> {
        let id = SubscriberId::new(self.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        let (subscriber, rx) = Subscriber::channel(id, capacity);
        self.attach(subscriber)?;
        Ok((id, rx))
    }

    /// Attach an existing subscriber handle. See [`SubscriberRegistry::attach`].
    pub fn attach(&self, subscriber: Subscriber) -> Result<bool> {
        let mut inner = self.inner.lock();
        let current: StateMessage = Arc::from(inner.state.to_json()?);
        let id = subscriber.id();
        let attached = inner.registry.attach(subscriber, &current)?;
        if attached {
            debug!(
                "[Relay] Subscriber {} attached (total: {})",
                id,
                inner.registry.len()
            );
        }
        Ok(attached)
    }

    pub fn detach(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.registry.detach(id);
        if removed {
            debug!(
                "[Relay] Subscriber {} detached (total: {})",
                id,
                inner.registry.len()
            );
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        let inner = self.inner.lock();
        self.broadcaster.stats(&inner.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};

    fn parse(message: &StateMessage) -> Value {
        serde_json::from_str(message).unwrap()
    }

    fn reading(presence: bool, motion: bool, distance: u32) -> SensorReading {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        SensorReading::new(presence, motion, distance, at)
    }

    #[test]
    fn test_publish_reading_broadcasts_once() {
        let relay = Relay::new();
        let (_id, mut rx) = relay.subscribe(DEFAULT_SUBSCRIBER_QUEUE).unwrap();
        let _catch_up = rx.try_recv().unwrap();

        let report = relay.publish_reading(reading(true, false, 120)).unwrap();
        assert_eq!(report.delivered, 1);

        let msg = rx.try_recv().unwrap();
        assert_eq!(
            parse(&msg),
            json!({
                "presence": true,
                "motion": false,
                "distance": 120,
                "timestamp": "2025-03-14T09:26:53.000Z",
                "connected": true
            })
        );
        assert!(rx.try_recv().is_err());

        let state = relay.snapshot();
        assert!(state.upstream_connected());
        assert_eq!(state.latest(), Some(&reading(true, false, 120)));
    }

    #[test]
    fn test_late_subscriber_sees_stale_reading_after_disconnect() {
        let relay = Relay::new();
        relay.publish_reading(reading(true, true, 75)).unwrap();
        relay.set_upstream_connected(false).unwrap();

        let (_id, mut rx) = relay.subscribe(DEFAULT_SUBSCRIBER_QUEUE).unwrap();
        let catch_up = parse(&rx.try_recv().unwrap());
        assert_eq!(catch_up["connected"], json!(false));
        assert_eq!(catch_up["presence"], json!(true));
        assert_eq!(catch_up["motion"], json!(true));
        assert_eq!(catch_up["distance"], json!(75));
        assert!(catch_up["timestamp"].is_string());
    }

    #[test]
    fn test_disconnect_broadcast_keeps_previous_fields() {
        let relay = Relay::new();
        let (_id, mut rx) = relay.subscribe(DEFAULT_SUBSCRIBER_QUEUE).unwrap();
        relay.publish_reading(reading(true, false, 120)).unwrap();
        relay.set_upstream_connected(false).unwrap();

        let _catch_up = rx.try_recv().unwrap();
        let before = parse(&rx.try_recv().unwrap());
        let after = parse(&rx.try_recv().unwrap());

        assert_eq!(after["connected"], json!(false));
        for field in ["presence", "motion", "distance", "timestamp"] {
            assert_eq!(before[field], after[field], "{} changed on disconnect", field);
        }
    }

    #[test]
    fn test_connectivity_broadcast_fires_even_if_unchanged() {
        let relay = Relay::new();
        relay.set_upstream_connected(false).unwrap();
        relay.set_upstream_connected(false).unwrap();
        assert_eq!(relay.stats().broadcasts, 2);
    }

    #[test]
    fn test_subscribe_allocates_distinct_ids() {
        let relay = Relay::new();
        let (a, _rx_a) = relay.subscribe(4).unwrap();
        let (b, _rx_b) = relay.subscribe(4).unwrap();
        assert_ne!(a, b);
        assert_eq!(relay.subscriber_count(), 2);

        assert!(relay.detach(a));
        assert!(!relay.detach(a));
        assert_eq!(relay.subscriber_count(), 1);
    }

    #[test]
    fn test_dropped_receiver_removed_on_next_broadcast() {
        let relay = Relay::new();
        let (gone, rx_gone) = relay.subscribe(4).unwrap();
        let (_kept, mut rx_kept) = relay.subscribe(4).unwrap();
        drop(rx_gone);

        let report = relay.publish_reading(reading(false, false, 0)).unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![gone]);
        assert_eq!(relay.subscriber_count(), 1);

        assert!(rx_kept.try_recv().is_ok());
        assert!(rx_kept.try_recv().is_ok());
    }

    #[test]
    fn test_broadcast_order_matches_event_order() {
        let relay = Relay::new();
        let (_id, mut rx) = relay.subscribe(DEFAULT_SUBSCRIBER_QUEUE).unwrap();
        let _catch_up = rx.try_recv().unwrap();

        for distance in [10, 20, 30] {
            relay.publish_reading(reading(true, true, distance)).unwrap();
        }

        for expected in [10, 20, 30] {
            assert_eq!(parse(&rx.try_recv().unwrap())["distance"], json!(expected));
        }
    }
}
