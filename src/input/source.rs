//! Upstream message sources for the sensor link.
//!
//! Two transports carry the same JSON objects:
//! - `tcp`: newline-delimited JSON over a plain TCP stream
//! - `ws`: one JSON object per WebSocket text frame (ESP32 firmware on port 81)

use crate::config::{UpstreamConfig, UpstreamTransport};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, connect_async};

/// Longest accepted upstream line, in bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// A connected upstream that yields raw message text.
#[async_trait]
pub trait UpstreamSource: Send {
    /// Next raw message. `Ok(None)` means the upstream closed the stream.
    async fn next_message(&mut self) -> Result<Option<String>>;

    /// Release the connection gracefully.
    async fn close(&mut self) {}
}

/// Newline-delimited messages over any byte stream.
pub struct LineSource<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> UpstreamSource for LineSource<R> {
    async fn next_message(&mut self) -> Result<Option<String>> {
        loop {
            self.buf.clear();
            let read = (&mut self.reader)
                .take(MAX_LINE_BYTES as u64 + 1)
                .read_until(b'\n', &mut self.buf)
                .await?;

            if read == 0 {
                return Ok(None);
            }
            if self.buf.len() > MAX_LINE_BYTES && self.buf.last() != Some(&b'\n') {
                return Err(RelayError::LinkUnavailable(format!(
                    "upstream line exceeds {} bytes",
                    MAX_LINE_BYTES
                )));
            }

            // Invalid UTF-8 is left for the decoder to reject as malformed
            let line = String::from_utf8_lossy(&self.buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(line.to_string()));
        }
    }
}

/// JSON messages carried in WebSocket frames.
pub struct WebSocketSource<S> {
    stream: WebSocketStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> WebSocketSource<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> UpstreamSource for WebSocketSource<S> {
    async fn next_message(&mut self) -> Result<Option<String>> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => {
                    let text_str: &str = &text;
                    return Ok(Some(text_str.to_string()));
                }
                Message::Binary(data) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Message::Close(_) => return Ok(None),
                // Pings are answered by tungstenite on the next read
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Open a connection to the configured upstream, bounded by the connect timeout.
pub async fn connect(config: &UpstreamConfig) -> Result<Box<dyn UpstreamSource>> {
    let address = config.address();

    let attempt = async {
        match config.transport {
            UpstreamTransport::Tcp => {
                let stream = TcpStream::connect(&address).await?;
                stream.set_nodelay(true)?;
                Ok::<Box<dyn UpstreamSource>, RelayError>(Box::new(LineSource::new(stream)))
            }
            UpstreamTransport::Ws => {
                let url = format!("ws://{}", address);
                let (stream, _) = connect_async(url).await?;
                Ok(Box::new(WebSocketSource::new(stream)) as Box<dyn UpstreamSource>)
            }
        }
    };

    match tokio::time::timeout(config.connect_timeout(), attempt).await {
        Ok(Ok(source)) => Ok(source),
        Ok(Err(e)) => Err(RelayError::LinkUnavailable(format!(
            "connect to {} failed: {}",
            address, e
        ))),
        Err(_) => Err(RelayError::LinkUnavailable(format!(
            "connect to {} timed out after {}s",
            address, config.connect_timeout_secs
        ))),
    }
}
