//! Delivery of relay state to every attached subscriber.

use super::registry::{StateMessage, SubscriberId, SubscriberRegistry};
use super::state::RelayState;
use crate::error::Result;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers that accepted the message.
    pub delivered: usize,
    /// Subscribers detached because their send failed.
    pub dropped: Vec<SubscriberId>,
}

/// Running totals across all broadcasts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub deliveries: u64,
    pub dropped_subscribers: u64,
    pub active_subscribers: usize,
}

/// Pushes the current state to all registered subscribers.
///
/// A failed send only detaches the subscriber concerned; the rest of the pass
/// continues and the caller never sees the failure.
#[derive(Debug, Default)]
pub struct Broadcaster {
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `state` once and deliver it to the subscribers registered now.
    pub fn broadcast(
        &self,
        state: &RelayState,
        registry: &mut SubscriberRegistry,
    ) -> Result<BroadcastReport> {
        let message: StateMessage = Arc::from(state.to_json()?);
        Ok(self.deliver(&message, registry))
    }

    fn deliver(
        &self,
        message: &StateMessage,
        registry: &mut SubscriberRegistry,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for subscriber in registry.snapshot() {
            match subscriber.try_send(message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!("[Relay] {}, detaching", e);
                    report.dropped.push(subscriber.id());
                }
            }
        }

        for id in &report.dropped {
            registry.detach(*id);
        }

        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add(report.dropped.len() as u64, Ordering::Relaxed);

        report
    }

    pub fn stats(&self, registry: &SubscriberRegistry) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped_subscribers: self.dropped.load(Ordering::Relaxed),
            active_subscribers: registry.len(),
        }
    }
}
