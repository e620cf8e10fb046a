//! # gambit-relay
//!
//! Chessboard relay server binary — starts the WebSocket relay and the
//! static asset listener, and shuts both down cleanly on ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gambit_server::assets::AssetListener;
use gambit_server::config::ServerConfig;
use gambit_server::registry::{DEFAULT_CAPACITY, Registry};
use gambit_server::relay::RelayListener;
use gambit_server::shutdown::ShutdownCoordinator;

/// Chessboard relay server.
#[derive(Parser, Debug)]
#[command(name = "gambit-relay", about = "Chessboard relay server")]
struct Cli {
    /// Host to bind both listeners on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// WebSocket relay port (0 for auto-assign).
    #[arg(long, default_value_t = 4220)]
    relay_port: u16,

    /// Static asset port (0 for auto-assign).
    #[arg(long, default_value_t = 4221)]
    assets_port: u16,

    /// Directory the asset listener serves the game client from.
    #[arg(long, default_value = "web")]
    web_root: PathBuf,

    /// Maximum concurrent sessions for one run.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig {
        host: cli.host,
        relay_port: cli.relay_port,
        assets_port: cli.assets_port,
        web_root: cli.web_root,
        capacity: cli.capacity,
        ..ServerConfig::default()
    };

    let registry = Arc::new(Registry::new(config.capacity));
    let shutdown = ShutdownCoordinator::new();

    let relay = RelayListener::bind(&config, Arc::clone(&registry))
        .await
        .with_context(|| format!("failed to bind relay on {}:{}", config.host, config.relay_port))?;
    let assets = AssetListener::bind(&config)
        .await
        .with_context(|| format!("failed to bind asset server on {}:{}", config.host, config.assets_port))?;

    let relay_addr = relay.local_addr().context("relay has no local address")?;
    let assets_addr = assets
        .local_addr()
        .context("asset server has no local address")?;
    info!(
        relay = %relay_addr,
        assets = %assets_addr,
        capacity = config.capacity,
        "gambit relay started"
    );

    let handles = vec![
        tokio::spawn(relay.run(shutdown.token())),
        tokio::spawn(assets.run(shutdown.token())),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    shutdown.graceful_shutdown(handles, None).await;

    Ok(())
}
