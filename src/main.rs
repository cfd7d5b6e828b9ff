//! PIM security gateway binary.

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use pim_security_gateway::config::loader::{default_config, load_config};
use pim_security_gateway::config::watcher::ConfigWatcher;
use pim_security_gateway::lifecycle::{signals, startup, Shutdown};
use pim_security_gateway::observability::{logging, metrics};
use pim_security_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "pim-security-gateway", version)]
#[command(about = "Request security layer for the PIM API")]
struct Cli {
    /// TOML config file. Without one, defaults and PIM_GATEWAY_* variables apply.
    #[arg(short, long, env = "PIM_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Reload outbound URL and upload policies when the file changes.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => default_config()?,
    };

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "pim-security-gateway starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let state = startup::start(&config).await?;

    let (_watcher, config_updates) = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.run()?), updates)
        }
        _ => (None, mpsc::unbounded_channel().1),
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    let server = GatewayServer::new(config, state);
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
