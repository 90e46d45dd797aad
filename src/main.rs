use clap::Parser;
use log::{error, info};
use mmwave_relay::config::{Config, UpstreamTransport, load_dotenv};
use mmwave_relay::input::SensorLink;
use mmwave_relay::relay::Relay;
use mmwave_relay::server::{STATE_PATH, SubscriberServer};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Relay a mmWave presence sensor feed to WebSocket dashboards.
///
/// Flags override environment variables (and `.env`), which override defaults.
#[derive(Parser)]
#[command(name = "mmwave-relay")]
struct Cli {
    /// Upstream sensor host
    #[arg(long)]
    upstream_host: Option<String>,

    /// Upstream sensor port
    #[arg(long)]
    upstream_port: Option<u16>,

    /// Upstream transport: tcp (newline-delimited JSON) or ws (WebSocket)
    #[arg(long)]
    transport: Option<UpstreamTransport>,

    /// Seconds between reconnect attempts
    #[arg(long)]
    retry_delay: Option<u64>,

    /// Port for dashboard WebSocket connections
    #[arg(long)]
    listen_port: Option<u16>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.upstream_host {
            config.upstream.host = host;
        }
        if let Some(port) = self.upstream_port {
            config.upstream.port = port;
        }
        if let Some(transport) = self.transport {
            config.upstream.transport = transport;
        }
        if let Some(delay) = self.retry_delay {
            config.upstream.retry_delay_secs = delay;
        }
        if let Some(port) = self.listen_port {
            config.server.listen_port = port;
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    load_dotenv();
    init_logger();
    info!("Starting mmWave relay");

    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(2);
    }

    info!("Configuration loaded:");
    info!(
        "  Upstream: {} ({})",
        config.upstream.address(),
        config.upstream.transport
    );
    info!("  Retry delay: {}s", config.upstream.retry_delay_secs);
    let hostname = gethostname::gethostname();
    info!(
        "  Viewers: ws://{}:{}{}",
        hostname.to_string_lossy(),
        config.server.listen_port,
        config.server.ws_path
    );
    info!(
        "  State:   http://{}:{}{}",
        hostname.to_string_lossy(),
        config.server.listen_port,
        STATE_PATH
    );

    let relay = Arc::new(Relay::new());
    let shutdown = CancellationToken::new();

    let server = SubscriberServer::new(config.server.clone(), relay.clone());
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "Failed to bind {}: {}",
                config.server.bind_address(),
                e
            );
            std::process::exit(1);
        }
    };
    let server_task = tokio::spawn(server.run(listener, shutdown.clone()));

    let link = SensorLink::new(config.upstream.clone(), relay.clone());
    let link_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { link.run(shutdown).await })
    };

    info!("mmWave relay is running");
    info!("  - Press Ctrl+C to exit");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    shutdown.cancel();
    if let Err(e) = link_task.await {
        error!("Sensor link task failed: {}", e);
    }
    if let Err(e) = server_task.await {
        error!("Subscriber server task failed: {}", e);
    }

    let stats = relay.stats();
    info!(
        "Relay stopped: {} broadcasts, {} deliveries, {} viewers dropped",
        stats.broadcasts, stats.deliveries, stats.dropped_subscribers
    );
}
