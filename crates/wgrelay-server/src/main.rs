//! wgrelay edge binary
//!
//! Brings up the WireGuard interface from the config file, serves the control
//! API on tunnel port 80, and runs the liveness sweeper. Port mappings are
//! created entirely over the API; there are no mapping flags here. The only
//! port to open on the host firewall is the WireGuard UDP port.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wgrelay_proto::CONTROL_PORT;
use wgrelay_server::{api, sweeper, Registry};
use wgrelay_splice::BufferPool;
use wgrelay_tun::{TunnelStack, WgConfig, WgStack};

/// wgrelay edge: expose agent-registered TCP services on public ports
#[derive(Parser, Debug)]
#[command(name = "wgrelay-server", version)]
struct Args {
    /// WireGuard configuration file
    #[arg(short = 'c', value_name = "FILE", default_value = "wg-server.conf")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short = 'v')]
    verbose: bool,

    /// I/O buffer size in KiB
    #[arg(short = 'b', value_name = "KIB", default_value_t = 64,
          value_parser = clap::value_parser!(u64).range(1..))]
    buffer_kib: u64,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = WgConfig::load(&args.config).context("failed to load WireGuard config")?;
    let stack = WgStack::up(&config)
        .await
        .context("failed to bring up WireGuard interface")?;
    info!(address = %stack.local_ip(), "WireGuard interface initialized");

    let tunnel: Arc<dyn TunnelStack> = Arc::new(stack);
    let pool = Arc::new(BufferPool::new(args.buffer_kib as usize * 1024));
    let registry = Arc::new(Registry::new(tunnel.clone(), pool));

    sweeper::spawn(registry.clone());

    let listener = api::bind(tunnel.as_ref(), CONTROL_PORT)
        .await
        .context("failed to listen on the tunnel control port")?;
    info!("control API listening on tunnel port {}", CONTROL_PORT);

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = api::serve(listener, registry) => {
            result.context("control API server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}
