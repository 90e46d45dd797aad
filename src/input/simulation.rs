//! Sensor simulation for testing.
//!
//! Emulates the ESP32 demo firmware: presence toggles every period, motion
//! follows presence and distance is 75 cm while someone is present. The
//! frames are served to any connecting relay over either transport.

use crate::config::UpstreamTransport;
use crate::error::{RelayError, Result};
use futures_util::SinkExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Distance reported by the demo firmware while presence is detected.
const PRESENT_DISTANCE_CM: u32 = 75;

/// How long a frame may wait on a relay that is not reading.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One frame in the firmware's wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SimulatedFrame {
    pub presence: bool,
    pub motion: bool,
    pub distance: u32,
}

impl SimulatedFrame {
    pub fn to_json(&self) -> String {
        // Three plain fields, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Toggling presence source.
#[derive(Debug, Default)]
pub struct SimulatedSensor {
    presence: bool,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current frame without advancing.
    pub fn current(&self) -> SimulatedFrame {
        SimulatedFrame {
            presence: self.presence,
            motion: self.presence,
            distance: if self.presence { PRESENT_DISTANCE_CM } else { 0 },
        }
    }

    /// Flip presence and return the new frame.
    pub fn advance(&mut self) -> SimulatedFrame {
        self.presence = !self.presence;
        self.current()
    }
}

/// Spawn a task that advances the simulated sensor every `period`.
///
/// The latest frame is published on `feed` as JSON text.
pub fn run_sensor_simulation(
    feed: watch::Sender<String>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sensor = SimulatedSensor::new();
        let mut interval = interval(period);
        // First tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let frame = sensor.advance();
                    info!(
                        "[Sim] presence={}, motion={}, distance={}cm",
                        frame.presence, frame.motion, frame.distance
                    );
                    feed.send_replace(frame.to_json());
                }
            }
        }
    })
}

/// Accept relay connections and stream the feed to each of them.
///
/// Every client gets the current frame on connect, then each new one.
pub async fn serve_simulation(
    listener: TcpListener,
    transport: UpstreamTransport,
    feed: watch::Receiver<String>,
    shutdown: CancellationToken,
) {
    let tracker = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("[Sim] Relay connected from {}", peer);
                    let feed = feed.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        serve_client(stream, peer, transport, feed, shutdown).await;
                    });
                }
                Err(e) => {
                    warn!("[Sim] Accept failed: {}", e);
                }
            }
        }
    }

    tracker.close();
    tracker.wait().await;
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    transport: UpstreamTransport,
    mut feed: watch::Receiver<String>,
    shutdown: CancellationToken,
) {
    let result = match transport {
        UpstreamTransport::Tcp => serve_lines(stream, &mut feed, &shutdown).await,
        UpstreamTransport::Ws => serve_websocket(stream, &mut feed, &shutdown).await,
    };

    match result {
        Ok(()) => info!("[Sim] Relay {} disconnected", peer),
        Err(e) => debug!("[Sim] Relay {} dropped: {}", peer, e),
    }
}

/// Run one write, giving up after `SEND_TIMEOUT` or when shutdown fires.
///
/// Returns `Ok(false)` if shutdown won; the caller drops the socket.
async fn send_bounded<F, E>(write: F, shutdown: &CancellationToken) -> Result<bool>
where
    F: Future<Output = std::result::Result<(), E>>,
    E: Into<RelayError>,
{
    tokio::select! {
        _ = shutdown.cancelled() => Ok(false),
        written = timeout(SEND_TIMEOUT, write) => match written {
            Ok(result) => result.map(|()| true).map_err(Into::into),
            Err(_) => Err(RelayError::LinkUnavailable(format!(
                "relay stopped reading for {:?}",
                SEND_TIMEOUT
            ))),
        },
    }
}

async fn serve_lines(
    mut stream: TcpStream,
    feed: &mut watch::Receiver<String>,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let line = format!("{}\n", feed.borrow_and_update().as_str());
        if !send_bounded(stream.write_all(line.as_bytes()), shutdown).await? {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = feed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    stream.shutdown().await?;
    Ok(())
}

async fn serve_websocket(
    stream: TcpStream,
    feed: &mut watch::Receiver<String>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut ws = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accepted = tokio_tungstenite::accept_async(stream) => accepted?,
    };
    loop {
        let frame = feed.borrow_and_update().clone();
        if !send_bounded(ws.send(Message::Text(frame.into())), shutdown).await? {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = feed.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    if let Ok(closed) = timeout(Duration::from_secs(1), ws.close(None)).await {
        closed?;
    }
    Ok(())
}
