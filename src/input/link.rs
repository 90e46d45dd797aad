//! Persistent link to the upstream mmWave sensor.
//!
//! Connects, decodes every message into a [`SensorReading`] and publishes it
//! through the relay. Any connect or read failure flips the relay to
//! disconnected, waits a fixed delay and tries again, forever, until the
//! shutdown token fires.

use super::source::{self, UpstreamSource};
use crate::config::UpstreamConfig;
use crate::error::RelayError;
use crate::relay::{BroadcastReport, Relay};
use crate::sensors::SensorReading;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use strum::Display;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Sensor link connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// How a connected session ended.
enum SessionEnd {
    Closed,
    Failed(RelayError),
    Shutdown,
}

/// Sensor link for one upstream source
pub struct SensorLink {
    config: UpstreamConfig,
    relay: Arc<Relay>,
    state: watch::Sender<LinkState>,
}

impl SensorLink {
    pub fn new(config: UpstreamConfig, relay: Arc<Relay>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            relay,
            state,
        }
    }

    /// Get current link state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Subscribe to link state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Run the connect/read/retry loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "[Link] Starting sensor link to {} ({}), retry every {}s",
            self.config.address(),
            self.config.transport,
            self.config.retry_delay_secs
        );

        loop {
            self.set_state(LinkState::Connecting);
            debug!("[Link] Connecting to {}", self.config.address());

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = source::connect(&self.config) => result,
            };

            match connected {
                Ok(mut upstream) => {
                    info!("[Link] Connected to {}", self.config.address());
                    self.set_state(LinkState::Connected);
                    self.broadcast_connectivity(true);

                    match self.pump(upstream.as_mut(), &shutdown).await {
                        SessionEnd::Shutdown => {
                            upstream.close().await;
                            break;
                        }
                        SessionEnd::Closed => {
                            warn!("[Link] Upstream closed the connection");
                        }
                        SessionEnd::Failed(e) => {
                            warn!("[Link] Connection error: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("[Link] {}", e);
                }
            }

            self.set_state(LinkState::Disconnected);
            self.broadcast_connectivity(false);

            // Wait before reconnecting
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_delay()) => {}
            }
        }

        if self.state() != LinkState::Disconnected {
            self.set_state(LinkState::Disconnected);
            self.broadcast_connectivity(false);
        }
        info!("[Link] Sensor link stopped");
    }

    /// Read messages until the session ends.
    async fn pump(
        &self,
        upstream: &mut dyn UpstreamSource,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                next = upstream.next_message() => next,
            };

            match next {
                Ok(Some(raw)) => {
                    self.handle_message(&raw);
                }
                Ok(None) => return SessionEnd::Closed,
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }

    /// Decode one upstream message and publish it.
    ///
    /// Malformed messages are logged and dropped without touching the relay.
    pub fn handle_message(&self, raw: &str) -> Option<BroadcastReport> {
        let reading = match SensorReading::decode(raw, Utc::now()) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("[Link] Dropping message {:?}: {}", raw, e);
                return None;
            }
        };

        info!(
            "[Link] Sensor: presence={}, motion={}, distance={}cm",
            reading.presence(),
            reading.motion(),
            reading.distance_cm()
        );

        match self.relay.publish_reading(reading) {
            Ok(report) => Some(report),
            Err(e) => {
                error!("[Link] Failed to broadcast reading: {}", e);
                None
            }
        }
    }

    fn broadcast_connectivity(&self, connected: bool) {
        if let Err(e) = self.relay.set_upstream_connected(connected) {
            error!("[Link] Failed to broadcast connectivity: {}", e);
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
    }
}
