//! Registry of attached downstream subscribers.
//!
//! Each subscriber is a bounded queue of serialized state messages drained by
//! its connection task. Delivery is a non-blocking enqueue, so a slow viewer
//! can never stall the relay: a full or closed queue counts as a failed send.

use crate::error::{RelayError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Serialized state message shared by every subscriber of one broadcast.
pub type StateMessage = Arc<str>;

/// Opaque identity of one attached downstream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sending half of a subscriber's outbound queue.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<StateMessage>,
}

impl Subscriber {
    /// Create a subscriber and the receiver its connection task drains.
    pub fn channel(id: SubscriberId, capacity: usize) -> (Self, mpsc::Receiver<StateMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Enqueue a message without waiting.
    pub fn try_send(&self, message: &StateMessage) -> Result<()> {
        self.tx
            .try_send(Arc::clone(message))
            .map_err(|_| RelayError::SubscriberSendFailure(self.id.get()))
    }
}

/// Live set of attached subscribers.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: HashMap<SubscriberId, Subscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber, sending it `current` before anything else.
    ///
    /// Returns `Ok(true)` when newly attached and `Ok(false)` when the id is
    /// already present (nothing is sent). A subscriber whose catch-up send
    /// fails is not attached.
    pub fn attach(&mut self, subscriber: Subscriber, current: &StateMessage) -> Result<bool> {
        if self.subscribers.contains_key(&subscriber.id()) {
            return Ok(false);
        }
        subscriber.try_send(current)?;
        self.subscribers.insert(subscriber.id(), subscriber);
        Ok(true)
    }

    /// Remove a subscriber. Unknown ids are a no-op; returns whether it was present.
    pub fn detach(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Copy of the current membership for one broadcast pass.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers.values().cloned().collect()
    }
}
