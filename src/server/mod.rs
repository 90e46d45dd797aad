//! HTTP endpoint for dashboard viewers.
//!
//! Each WebSocket upgrade on the configured path becomes one relay
//! subscriber: it receives the current state immediately, then every
//! broadcast, until either side closes. `GET /api/state` answers with the
//! same JSON payload for clients that poll instead.

mod session;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::relay::{Relay, StatePayload};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use session::SessionSettings;

/// Polling endpoint returning the current state payload.
pub const STATE_PATH: &str = "/api/state";

pub struct SubscriberServer {
    config: ServerConfig,
    relay: Arc<Relay>,
}

/// Shared by every request handler.
#[derive(Clone)]
struct ServerContext {
    relay: Arc<Relay>,
    settings: Arc<SessionSettings>,
    sessions: TaskTracker,
    shutdown: CancellationToken,
}

impl SubscriberServer {
    pub fn new(config: ServerConfig, relay: Arc<Relay>) -> Self {
        Self { config, relay }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        Ok(listener)
    }

    /// Serve viewers until `shutdown` fires, then wait for open sessions to close.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => {
                info!(
                    "[Server] Listening for viewers on ws://{}{}",
                    addr, self.config.ws_path
                );
                info!("[Server] State polling on http://{}{}", addr, STATE_PATH);
            }
            Err(e) => warn!("[Server] Listening on unknown address: {}", e),
        }

        let sessions = TaskTracker::new();
        let context = ServerContext {
            relay: self.relay.clone(),
            settings: Arc::new(SessionSettings {
                heartbeat: self.config.heartbeat(),
                send_timeout: self.config.send_timeout(),
            }),
            sessions: sessions.clone(),
            shutdown: shutdown.clone(),
        };
        let app = Router::new()
            .route(&self.config.ws_path, get(viewer_handler))
            .route(STATE_PATH, get(state_handler))
            .with_state(context);

        // Upgraded connections leave hyper's graceful shutdown; `sessions` tracks them
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
        if let Err(e) = served {
            error!("[Server] Listener failed: {}", e);
        }

        sessions.close();
        sessions.wait().await;
        info!("[Server] Subscriber server stopped");
    }
}

async fn viewer_handler(
    upgrade: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(context): State<ServerContext>,
) -> impl IntoResponse {
    let in_flight = context.sessions.token();
    upgrade.on_upgrade(move |socket| async move {
        session::serve(
            socket,
            peer,
            context.relay,
            context.settings,
            context.shutdown,
        )
        .await;
        drop(in_flight);
    })
}

async fn state_handler(State(context): State<ServerContext>) -> Json<StatePayload> {
    Json(context.relay.snapshot().payload())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::SensorReading;
    use chrono::Utc;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn server_config(heartbeat_secs: u64) -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            ws_path: "/ws".to_string(),
            heartbeat_secs,
            send_timeout_secs: 30,
        }
    }

    async fn start(
        relay: Arc<Relay>,
        heartbeat_secs: u64,
    ) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<()>) {
        let server = SubscriberServer::new(server_config(heartbeat_secs), relay);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(listener, shutdown.clone()));
        (addr, shutdown, handle)
    }

    async fn next_state(client: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for state")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = frame {
                let text_str: &str = &text;
                return serde_json::from_str(text_str).unwrap();
            }
        }
    }

    async fn wait_for_subscribers(relay: &Relay, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while relay.subscriber_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    #[tokio::test]
    async fn test_viewer_gets_catch_up_then_broadcasts() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, handle) = start(relay.clone(), 0).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        let initial = next_state(&mut client).await;
        assert_eq!(
            initial,
            json!({
                "presence": false,
                "motion": false,
                "distance": 0,
                "timestamp": null,
                "connected": false
            })
        );
        wait_for_subscribers(&relay, 1).await;

        relay
            .publish_reading(SensorReading::new(true, false, 120, Utc::now()))
            .unwrap();
        let update = next_state(&mut client).await;
        assert_eq!(update["presence"], json!(true));
        assert_eq!(update["distance"], json!(120));
        assert_eq!(update["connected"], json!(true));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_viewer_sees_last_reading_while_disconnected() {
        let relay = Arc::new(Relay::new());
        relay
            .publish_reading(SensorReading::new(true, true, 64, Utc::now()))
            .unwrap();
        relay.set_upstream_connected(false).unwrap();
        let (addr, shutdown, _handle) = start(relay.clone(), 0).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        let initial = next_state(&mut client).await;
        assert_eq!(initial["connected"], json!(false));
        assert_eq!(initial["presence"], json!(true));
        assert_eq!(initial["distance"], json!(64));
        assert!(initial["timestamp"].is_string());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_closed_viewer_does_not_affect_others() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, _handle) = start(relay.clone(), 0).await;
        let url = format!("ws://{}/ws", addr);

        let (mut leaving, _) = connect_async(url.as_str()).await.unwrap();
        let (mut staying, _) = connect_async(url.as_str()).await.unwrap();
        next_state(&mut leaving).await;
        next_state(&mut staying).await;
        wait_for_subscribers(&relay, 2).await;

        leaving.close(None).await.unwrap();
        wait_for_subscribers(&relay, 1).await;

        relay
            .publish_reading(SensorReading::new(false, false, 0, Utc::now()))
            .unwrap();
        let update = next_state(&mut staying).await;
        assert_eq!(update["connected"], json!(true));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_inbound_text_is_ignored() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, _handle) = start(relay.clone(), 0).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        next_state(&mut client).await;
        client
            .send(Message::Text("hello relay".to_string().into()))
            .await
            .unwrap();

        relay.set_upstream_connected(true).unwrap();
        let update = next_state(&mut client).await;
        assert_eq!(update["connected"], json!(true));
        assert_eq!(relay.subscriber_count(), 1);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, _handle) = start(relay.clone(), 0).await;

        let result = connect_async(format!("ws://{}/other", addr)).await;
        assert!(result.is_err());
        assert_eq!(relay.subscriber_count(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_heartbeat_pings_viewers() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, _handle) = start(relay.clone(), 1).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        next_state(&mut client).await;

        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no heartbeat")
            .unwrap()
            .unwrap();
        assert!(matches!(frame, Message::Ping(_)));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_viewers() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, handle) = start(relay.clone(), 0).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        next_state(&mut client).await;
        wait_for_subscribers(&relay, 1).await;

        shutdown.cancel();
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("viewer was not closed");
        assert!(matches!(frame, Some(Ok(Message::Close(_))) | None));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_viewer_close_is_acknowledged() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, _handle) = start(relay.clone(), 0).await;

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        next_state(&mut client).await;
        wait_for_subscribers(&relay, 1).await;

        client.close(None).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("close was never answered");
        assert!(matches!(reply, Some(Ok(Message::Close(_)))));
        wait_for_subscribers(&relay, 0).await;

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stalled_viewer_is_dropped_and_server_stops() {
        let relay = Arc::new(Relay::new());
        let (addr, shutdown, handle) = start(relay.clone(), 0).await;

        // Reads the catch-up, then never reads again
        let (mut stalled, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        next_state(&mut stalled).await;
        wait_for_subscribers(&relay, 1).await;

        let publishes = tokio::time::timeout(Duration::from_secs(60), async {
            let mut publishes = 0u64;
            while relay.subscriber_count() > 0 {
                relay
                    .publish_reading(SensorReading::new(true, true, 250, Utc::now()))
                    .unwrap();
                publishes += 1;
                tokio::task::yield_now().await;
            }
            publishes
        })
        .await
        .expect("stalled viewer was never detached");
        assert!(publishes > 0);
        assert_eq!(relay.stats().dropped_subscribers, 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop with a stalled viewer")
            .unwrap();
        drop(stalled);
    }

    #[tokio::test]
    async fn test_state_endpoint_returns_snapshot() {
        let relay = Arc::new(Relay::new());
        relay
            .publish_reading(SensorReading::new(true, false, 42, Utc::now()))
            .unwrap();
        let (addr, shutdown, handle) = start(relay.clone(), 0).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /api/state HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
            .await
            .expect("no response")
            .unwrap();

        let response = String::from_utf8(raw).unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.to_ascii_lowercase().contains("content-type: application/json"));

        let state: Value = serde_json::from_str(body).unwrap();
        let expected = serde_json::to_value(relay.snapshot().payload()).unwrap();
        assert_eq!(state, expected);
        assert_eq!(state["distance"], json!(42));
        assert_eq!(state["connected"], json!(true));
        // Polling does not register a subscriber
        assert_eq!(relay.subscriber_count(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}
