//! vmstream: serve VM device tunnels over WebSocket.
//!
//! Loads the configuration and instance inventory, then serves the
//! subresource API until interrupted. Open tunnels are cancelled on shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vmstream::api::{AppState, router};
use vmstream::config::Config;
use vmstream::device::DeviceTunnels;
use vmstream::dial::NodeAgents;
use vmstream::inventory::Inventory;
use vmstream::metrics::TunnelMetrics;
use vmstream::logging;

/// VM device tunnel server
#[derive(Parser, Debug)]
#[command(name = "vmstream", version, about = "VM device tunnel server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Instance inventory JSON (overrides the config file)
    #[arg(short, long)]
    inventory: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init();
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(inventory) = args.inventory {
        config.inventory = Some(inventory);
    }

    let inventory = match &config.inventory {
        Some(path) => Arc::new(Inventory::load(path)?),
        None => {
            warn!("no inventory configured; every instance lookup will be NotFound");
            Arc::new(Inventory::empty())
        }
    };
    let _watcher = match inventory.path() {
        Some(_) => Some(inventory.watch()?),
        None => None,
    };

    let agents = Arc::new(
        NodeAgents::from_config(&config.node_agent).context("configuring node agent client")?,
    );
    let shutdown = CancellationToken::new();
    let tunnels = DeviceTunnels::new(
        inventory,
        agents,
        Arc::new(TunnelMetrics::new()),
        config.tunnel.clone(),
        config.feature_gates.clone(),
    )
    .with_shutdown(shutdown.clone());

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(addr = %config.listen, "vmstream listening");

    let signal = shutdown.clone();
    axum::serve(listener, router(AppState::new(tunnels)))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutting down");
            signal.cancel();
        })
        .await
        .context("serving API")?;

    Ok(())
}
