//! wgrelay agent binary
//!
//! Brings up the WireGuard interface, probes the edge, registers every `-r`
//! route, then heartbeats until a signal arrives or the edge stops
//! answering. On SIGINT/SIGTERM the registered mappings are deleted before
//! exit; if the edge misses three heartbeats the agent exits non-zero and
//! leaves eviction to the edge's sweeper.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wgrelay_agent::{Agent, ControlClient, RouteSpec};
use wgrelay_proto::CONTROL_PORT;
use wgrelay_splice::BufferPool;
use wgrelay_tun::{derive_peer_addrs, TunnelStack, WgConfig, WgStack};

/// wgrelay agent: expose local TCP services through the edge
#[derive(Parser, Debug)]
#[command(name = "wgrelay-agent", version)]
struct Args {
    /// WireGuard configuration file
    #[arg(short = 'c', value_name = "FILE", default_value = "wg-client.conf")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short = 'v')]
    verbose: bool,

    /// I/O buffer size in KiB
    #[arg(short = 'b', value_name = "KIB", default_value_t = 64,
          value_parser = clap::value_parser!(u64).range(1..))]
    buffer_kib: u64,

    /// Route mapping <localHost>:<localPort>-<remotePort>, repeatable
    #[arg(short = 'r', value_name = "SPEC", required = true)]
    route: Vec<RouteSpec>,

    /// Edge tunnel address (default: derived as .1 / ::1 of the interface address)
    #[arg(long = "server-ip", value_name = "IP")]
    server_ip: Option<IpAddr>,
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

    let (client_ip, server_ip) = match derive_peer_addrs(&config.interface.addresses) {
        Ok((client, derived)) => (client, args.server_ip.unwrap_or(derived)),
        Err(e) => {
            let first = config
                .interface
                .addresses
                .first()
                .map(|cidr| cidr.addr)
                .context("configuration has no interface address")?;
            let server = args
                .server_ip
                .with_context(|| format!("{e}; pass --server-ip"))?;
            (first, server)
        }
    };
    info!(%client_ip, %server_ip, "tunnel addresses resolved");

    let stack = WgStack::up(&config)
        .await
        .context("failed to bring up WireGuard interface")?;
    let tunnel: Arc<dyn TunnelStack> = Arc::new(stack);
    let pool = Arc::new(BufferPool::new(args.buffer_kib as usize * 1024));

    let control = ControlClient::new(
        tunnel.clone(),
        SocketAddr::new(server_ip, CONTROL_PORT),
        client_ip,
    );
    let agent = Arc::new(Agent::new(tunnel, control, pool, &args.route)?);

    agent.probe().await.context("Server is not available")?;

    agent.start().await.context("failed to start agent")?;
    agent.spawn_heartbeat();

    let mut shutdown = agent.shutdown_watch();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, cleaning up");
            agent.cleanup().await;
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, cleaning up");
            agent.cleanup().await;
        }
        _ = shutdown.changed() => {
            anyhow::bail!("server is unreachable, shutting down");
        }
    }

    Ok(())
}
