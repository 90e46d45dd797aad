//! Fake mmWave sensor for running the relay without hardware.
//!
//! Usage:
//!   cargo run --bin fake-sensor -- --port 9000
//!   cargo run --bin fake-sensor -- --transport ws --port 81
//!
//! Mirrors the ESP32 demo firmware: presence toggles every period and each
//! frame is pushed to every connected relay.

use clap::Parser;
use log::{error, info};
use mmwave_relay::config::UpstreamTransport;
use mmwave_relay::input::simulation::{SimulatedSensor, run_sensor_simulation, serve_simulation};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "fake-sensor")]
#[command(about = "Serve simulated mmWave readings to the relay")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "FAKE_SENSOR_ADDR", default_value = "127.0.0.1")]
    addr: String,

    /// Port to listen on
    #[arg(long, env = "FAKE_SENSOR_PORT", default_value_t = 9000)]
    port: u16,

    /// Transport: tcp (newline-delimited JSON) or ws (WebSocket)
    #[arg(long, default_value_t = UpstreamTransport::Tcp)]
    transport: UpstreamTransport,

    /// Milliseconds between readings
    #[arg(long, default_value_t = 1000)]
    period_ms: u64,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let bind = format!("{}:{}", cli.addr, cli.port);
    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind, e);
            std::process::exit(1);
        }
    };
    info!(
        "Fake sensor serving {} frames on {} every {}ms",
        cli.transport, bind, cli.period_ms
    );

    let shutdown = CancellationToken::new();
    let (feed_tx, feed_rx) = watch::channel(SimulatedSensor::new().current().to_json());
    let simulation = run_sensor_simulation(
        feed_tx,
        Duration::from_millis(cli.period_ms.max(1)),
        shutdown.clone(),
    );
    let server = tokio::spawn(serve_simulation(
        listener,
        cli.transport,
        feed_rx,
        shutdown.clone(),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
    shutdown.cancel();
    let _ = simulation.await;
    let _ = server.await;
}
