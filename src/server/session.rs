//! One viewer connection.

use crate::error::RelayError;
use crate::relay::{DEFAULT_SUBSCRIBER_QUEUE, Relay, SubscriberId};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, interval_at, timeout};
use tokio_util::sync::CancellationToken;

/// Upper bound on the closing handshake once the session is over.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub heartbeat: Option<Duration>,
    pub send_timeout: Duration,
}

/// Why a session loop ended.
#[derive(Debug)]
enum SessionEnd {
    /// Shutdown fired while the session was idle.
    Shutdown,
    /// The viewer sent Close or hung up.
    ViewerClosed,
    /// The broadcaster detached this subscriber after a failed delivery.
    Detached,
    /// A frame could not be written within the send timeout.
    Stalled,
    /// Shutdown fired while a frame was still being written.
    Interrupted,
    Failed(RelayError),
}

type ViewerSink = SplitSink<WebSocket, Message>;

/// Serve one upgraded viewer until it disconnects, its queue is dropped, or shutdown.
pub(super) async fn serve(
    socket: WebSocket,
    peer: SocketAddr,
    relay: Arc<Relay>,
    settings: Arc<SessionSettings>,
    shutdown: CancellationToken,
) {
    let (id, mut queue) = match relay.subscribe(DEFAULT_SUBSCRIBER_QUEUE) {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("[Server] Could not attach viewer {}: {}", peer, e);
            return;
        }
    };
    info!(
        "[Server] Viewer {} connected from {} (total: {})",
        id,
        peer,
        relay.subscriber_count()
    );

    let (mut sink, mut incoming) = socket.split();
    let mut heartbeat = settings
        .heartbeat
        .map(|period| interval_at(Instant::now() + period, period));

    let end = loop {
        let outbound = tokio::select! {
            _ = shutdown.cancelled() => break SessionEnd::Shutdown,
            queued = queue.recv() => match queued {
                Some(state) => Message::Text(state.to_string().into()),
                None => break SessionEnd::Detached,
            },
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    debug!("[Server] Viewer {} sent: {}", id, text.as_str());
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::ViewerClosed,
                Some(Ok(_)) => continue,
                Some(Err(e)) => break SessionEnd::Failed(e.into()),
            },
            _ = tick(&mut heartbeat) => Message::Ping(Default::default()),
        };

        if let Err(end) = send_bounded(&mut sink, outbound, &settings, &shutdown).await {
            break end;
        }
    };

    match end {
        SessionEnd::Shutdown | SessionEnd::ViewerClosed => {
            // Sends our Close on shutdown, or flushes the reply to the viewer's Close
            if let Ok(Err(e)) = timeout(CLOSE_TIMEOUT, sink.close()).await {
                debug!("[Server] Viewer {} close failed: {}", id, e);
            }
        }
        SessionEnd::Detached => debug!("[Server] Viewer {} fell behind, dropping", id),
        SessionEnd::Stalled => warn!(
            "[Server] Viewer {} stopped reading for {:?}, dropping",
            id, settings.send_timeout
        ),
        SessionEnd::Interrupted => debug!("[Server] Viewer {} dropped mid-send on shutdown", id),
        SessionEnd::Failed(e) => debug!("[Server] Viewer {} dropped: {}", id, e),
    }
    disconnect(&relay, id);
}

/// Write one frame, giving up after the send timeout or when shutdown fires.
async fn send_bounded(
    sink: &mut ViewerSink,
    message: Message,
    settings: &SessionSettings,
    shutdown: &CancellationToken,
) -> std::result::Result<(), SessionEnd> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(SessionEnd::Interrupted),
        sent = timeout(settings.send_timeout, sink.send(message)) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionEnd::Failed(e.into())),
            Err(_) => Err(SessionEnd::Stalled),
        },
    }
}

fn disconnect(relay: &Relay, id: SubscriberId) {
    relay.detach(id);
    info!(
        "[Server] Viewer {} disconnected (total: {})",
        id,
        relay.subscriber_count()
    );
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
