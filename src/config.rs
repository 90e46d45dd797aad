use crate::error::{RelayError, Result};
use crate::server::STATE_PATH;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: We're single-threaded at this point (called before any async runtime)
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Split .env content into key/value pairs, skipping blanks and comments.
fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            if !key.is_empty() {
                pairs.push((key, value));
            }
        }
    }

    pairs
}

/// Wire protocol spoken by the upstream sensor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UpstreamTransport {
    /// Newline-delimited JSON over a plain TCP stream.
    #[default]
    Tcp,
    /// One JSON object per WebSocket text frame (ESP32 firmware).
    Ws,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub transport: UpstreamTransport,
    pub retry_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub ws_path: String,
    pub heartbeat_secs: u64,
    pub send_timeout_secs: u64,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Ping interval for subscriber connections. Zero disables keepalive.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_secs > 0).then(|| Duration::from_secs(self.heartbeat_secs))
    }

    /// How long one frame may wait on a viewer that is not reading.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                // ESP32 soft-AP default address
                host: "192.168.4.1".to_string(),
                port: 81,
                transport: UpstreamTransport::Tcp,
                retry_delay_secs: 5,
                connect_timeout_secs: 10,
            },
            server: ServerConfig {
                listen_addr: "0.0.0.0".to_string(),
                listen_port: 8080,
                ws_path: "/ws".to_string(),
                heartbeat_secs: 15,
                send_timeout_secs: 10,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("UPSTREAM_HOST") {
            config.upstream.host = host;
        }
        if let Ok(port) = std::env::var("UPSTREAM_PORT")
            && let Ok(p) = port.parse()
        {
            config.upstream.port = p;
        }
        if let Ok(transport) = std::env::var("UPSTREAM_TRANSPORT")
            && let Ok(t) = transport.parse()
        {
            config.upstream.transport = t;
        }
        if let Ok(delay) = std::env::var("RETRY_DELAY_SECS")
            && let Ok(d) = delay.parse()
        {
            config.upstream.retry_delay_secs = d;
        }
        if let Ok(timeout) = std::env::var("CONNECT_TIMEOUT_SECS")
            && let Ok(t) = timeout.parse()
        {
            config.upstream.connect_timeout_secs = t;
        }

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            config.server.listen_addr = addr;
        }
        if let Ok(port) = std::env::var("LISTEN_PORT")
            && let Ok(p) = port.parse()
        {
            config.server.listen_port = p;
        }
        if let Ok(path) = std::env::var("WS_PATH") {
            config.server.ws_path = path;
        }
        if let Ok(secs) = std::env::var("HEARTBEAT_SECS")
            && let Ok(s) = secs.parse()
        {
            config.server.heartbeat_secs = s;
        }
        if let Ok(secs) = std::env::var("SEND_TIMEOUT_SECS")
            && let Ok(s) = secs.parse()
        {
            config.server.send_timeout_secs = s;
        }

        config
    }

    /// Build a configuration from key-value options, starting from defaults.
    ///
    /// Recognised keys: `upstreamHost`, `upstreamPort`, `upstreamTransport`,
    /// `retryDelaySecs`, `connectTimeoutSecs`, `listenAddr`, `listenPort`,
    /// `wsPath`, `heartbeatSecs`, `sendTimeoutSecs`. Unknown keys and unparsable
    /// values are errors.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "upstreamHost" => config.upstream.host = value.to_string(),
                "upstreamPort" => config.upstream.port = parse_value(key, value)?,
                "upstreamTransport" => config.upstream.transport = parse_value(key, value)?,
                "retryDelaySecs" => config.upstream.retry_delay_secs = parse_value(key, value)?,
                "connectTimeoutSecs" => {
                    config.upstream.connect_timeout_secs = parse_value(key, value)?
                }
                "listenAddr" => config.server.listen_addr = value.to_string(),
                "listenPort" => config.server.listen_port = parse_value(key, value)?,
                "wsPath" => config.server.ws_path = value.to_string(),
                "heartbeatSecs" => config.server.heartbeat_secs = parse_value(key, value)?,
                "sendTimeoutSecs" => {
                    config.server.send_timeout_secs = parse_value(key, value)?
                }
                other => {
                    return Err(RelayError::InvalidConfig(format!(
                        "unknown option: {}",
                        other
                    )));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.host.is_empty() {
            return Err(RelayError::InvalidConfig(
                "upstream host must not be empty".to_string(),
            ));
        }
        if self.upstream.port == 0 {
            return Err(RelayError::InvalidConfig(
                "upstream port must not be 0".to_string(),
            ));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(RelayError::InvalidConfig(format!(
                "WebSocket path must start with '/', got: {}",
                self.server.ws_path
            )));
        }
        if self.server.ws_path == STATE_PATH {
            return Err(RelayError::InvalidConfig(format!(
                "WebSocket path collides with the state endpoint {}",
                STATE_PATH
            )));
        }
        if self.server.send_timeout_secs == 0 {
            return Err(RelayError::InvalidConfig(
                "send timeout must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| RelayError::InvalidConfig(format!("invalid value for {}: {:?}", key, value)))
}
