//! Agent orchestration
//!
//! Owns the route table, the tunnel-side listeners, and the heartbeat loop.
//! Shutdown is a single watch channel: the heartbeat loop closes it when the
//! edge stops answering, the signal handler closes it on SIGINT/SIGTERM, and
//! every route listener exits when it fires.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wgrelay_splice::{splice, BufferPool};
use wgrelay_tun::{BoxStream, TunnelListener, TunnelStack};

use crate::control::{ControlClient, ControlError};
use crate::routes::{self, RouteMapping, RouteSpec};

/// Heartbeat cadence. The edge evicts after 60 s of silence, so three beats
/// fit inside the deadline.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Consecutive heartbeat failures before the agent gives up on the edge.
pub const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Pause after a transient accept failure on a tunnel listener.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Route(#[from] routes::RouteError),

    #[error("failed to listen on tunnel port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to register port mapping for port {port}: {source}")]
    Register {
        port: u16,
        #[source]
        source: ControlError,
    },
}

pub struct Agent {
    tunnel: Arc<dyn TunnelStack>,
    control: ControlClient,
    pool: Arc<BufferPool>,
    mappings: Vec<RouteMapping>,
    /// Last startup timestamp seen from the edge; 0 until the first reply.
    server_startup: AtomicI64,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    /// Build the route table, drawing a random tunnel port per route.
    pub fn new(
        tunnel: Arc<dyn TunnelStack>,
        control: ControlClient,
        pool: Arc<BufferPool>,
        specs: &[RouteSpec],
    ) -> Result<Self, AgentError> {
        let mappings = routes::assign_tunnel_ports(specs)?;
        for mapping in &mappings {
            info!(
                "added route mapping: {} <- {}:{} <- remote:{}",
                mapping.local_addr,
                control.client_ip(),
                mapping.client_port,
                mapping.remote_port
            );
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            tunnel,
            control,
            pool,
            mappings,
            server_startup: AtomicI64::new(0),
            shutdown,
        })
    }

    pub fn mappings(&self) -> &[RouteMapping] {
        &self.mappings
    }

    /// Subscribe to the shutdown channel; fires when the edge is declared
    /// dead or cleanup begins.
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// One heartbeat to check the edge answers at all. Failure here is fatal
    /// at startup.
    pub async fn probe(&self) -> Result<(), ControlError> {
        self.heartbeat_now().await
    }

    /// Open every tunnel listener and register every mapping. A registration
    /// failure rolls back the ones that succeeded and aborts.
    pub async fn start(&self) -> Result<(), AgentError> {
        // Listeners first: the edge dials as soon as a POST lands.
        for mapping in &self.mappings {
            let listener =
                self.tunnel
                    .listen(mapping.client_port)
                    .await
                    .map_err(|source| AgentError::Listen {
                        port: mapping.client_port,
                        source,
                    })?;
            info!(
                "route listener started on tunnel port {}, forwarding to {}",
                mapping.client_port, mapping.local_addr
            );
            tokio::spawn(route_listener(
                listener,
                mapping.clone(),
                self.pool.clone(),
                self.shutdown.subscribe(),
            ));
        }

        let mut registered: Vec<u16> = Vec::new();
        for mapping in &self.mappings {
            match self.control.register(mapping).await {
                Ok(()) => registered.push(mapping.remote_port),
                Err(source) => {
                    error!(
                        "failed to register port mapping for port {}: {}",
                        mapping.remote_port, source
                    );
                    for port in registered {
                        if let Err(e) = self.control.delete(port).await {
                            warn!("rollback failed for port {}: {}", port, e);
                        }
                    }
                    return Err(AgentError::Register {
                        port: mapping.remote_port,
                        source,
                    });
                }
            }
        }

        info!(
            "all {} route mappings registered successfully",
            self.mappings.len()
        );
        Ok(())
    }

    /// Run the heartbeat loop until shutdown.
    pub fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            let mut shutdown = agent.shutdown.subscribe();
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            // The probe already counted as the first beat.
            ticker.tick().await;

            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("heartbeat loop stopped by shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if agent.heartbeat_tick(&mut failures).await {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One heartbeat attempt with failure accounting. Returns `true` once
    /// the failure budget is spent and shutdown has been signalled.
    pub async fn heartbeat_tick(&self, failures: &mut u32) -> bool {
        match self.heartbeat_now().await {
            Ok(()) => {
                *failures = 0;
                false
            }
            Err(e) => {
                *failures += 1;
                warn!(
                    "failed to send heartbeat (attempt {}/{}): {}",
                    failures, MAX_HEARTBEAT_FAILURES, e
                );
                if *failures >= MAX_HEARTBEAT_FAILURES {
                    error!(
                        "server appears to be dead after {} failed heartbeat attempts, shutting down",
                        MAX_HEARTBEAT_FAILURES
                    );
                    self.shutdown.send_replace(true);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Send one heartbeat and handle restart detection: a changed startup
    /// timestamp means the edge lost its registry, so every mapping is
    /// re-registered. Individual re-registration failures are logged and
    /// left to the failure counter on subsequent ticks.
    pub async fn heartbeat_now(&self) -> Result<(), ControlError> {
        let startup = self.control.heartbeat().await?;

        let previous = self.server_startup.load(Ordering::Acquire);
        if previous != 0 && previous != startup {
            warn!(
                "server restart detected (startup time {} -> {}), re-registering {} port mappings",
                previous,
                startup,
                self.mappings.len()
            );
            for mapping in &self.mappings {
                if let Err(e) = self.control.register(mapping).await {
                    warn!(
                        "failed to re-register port mapping for port {}: {}",
                        mapping.remote_port, e
                    );
                }
            }
            info!("port mapping re-registration completed");
        }
        self.server_startup.store(startup, Ordering::Release);

        Ok(())
    }

    /// Best-effort deletion of every mapping; used on SIGINT/SIGTERM.
    /// Network errors are logged and ignored — the liveness sweeper covers
    /// anything left behind.
    pub async fn cleanup(&self) {
        self.shutdown.send_replace(true);
        info!("cleaning up {} port mappings", self.mappings.len());
        for mapping in &self.mappings {
            if let Err(e) = self.control.delete(mapping.remote_port).await {
                warn!(
                    "failed to delete port mapping for port {}: {}",
                    mapping.remote_port, e
                );
            }
        }
    }
}

/// Accept tunnel-side connections for one route until shutdown.
async fn route_listener(
    mut listener: Box<dyn TunnelListener>,
    mapping: RouteMapping,
    pool: Arc<BufferPool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let mapping = mapping.clone();
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        route_connection(conn, peer, mapping, pool).await;
                    });
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    warn!(
                        port = mapping.client_port,
                        "failed to accept tunnel connection: {}", e
                    );
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    debug!(port = mapping.client_port, "route listener stopped");
}

/// Dial the local service and splice it to the tunnel connection.
async fn route_connection(
    conn: BoxStream,
    peer: std::net::SocketAddr,
    mapping: RouteMapping,
    pool: Arc<BufferPool>,
) {
    let local = match TcpStream::connect(&mapping.local_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(
                "failed to connect to local service {}: {}",
                mapping.local_addr, e
            );
            return;
        }
    };

    debug!(
        %peer,
        local = %mapping.local_addr,
        remote_port = mapping.remote_port,
        "established route connection"
    );
    let (from_edge, to_edge) = splice(conn, local, &pool).await;
    debug!(
        %peer,
        local = %mapping.local_addr,
        bytes_in = from_edge,
        bytes_out = to_edge,
        "route connection closed"
    );
}
