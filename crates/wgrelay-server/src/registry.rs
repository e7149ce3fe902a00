//! Mapping registry
//!
//! One table of active port mappings, one table of known agents, and the
//! startup timestamp, all behind a single async mutex. Every API handler and
//! the liveness sweeper serialize through that mutex; the per-mapping accept
//! loops never touch it after launch — they own their listener and cancel
//! channel.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use wgrelay_proto::PortMappingRequest;
use wgrelay_splice::BufferPool;
use wgrelay_tun::TunnelStack;

use crate::proxy;
use crate::sweeper::format_idle;

/// Create failures the API maps to 409 / 500.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("port {0} is already mapped by another client")]
    Conflict(u16),

    #[error("failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Delete failures the API maps to 404.
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("no mapping found for port {0}")]
    NotFound(u16),
}

/// An active mapping: the accept-loop task plus everything needed to stop it.
struct PortMapping {
    local_addr: String,
    client_ip: IpAddr,
    client_port: u16,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Liveness record for one agent, keyed by tunnel address.
struct AgentRecord {
    last_heartbeat: Instant,
    ports: HashSet<u16>,
}

impl AgentRecord {
    fn new() -> Self {
        Self {
            last_heartbeat: Instant::now(),
            ports: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct Tables {
    mappings: HashMap<u16, PortMapping>,
    agents: HashMap<IpAddr, AgentRecord>,
}

/// The edge's shared state: mapping table, agent table, startup timestamp.
pub struct Registry {
    tunnel: Arc<dyn TunnelStack>,
    pool: Arc<BufferPool>,
    startup_time: i64,
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new(tunnel: Arc<dyn TunnelStack>, pool: Arc<BufferPool>) -> Self {
        Self {
            tunnel,
            pool,
            startup_time: chrono::Utc::now().timestamp(),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Wall-clock process start, seconds since the Unix epoch. Sent in every
    /// heartbeat reply so agents can detect a restart.
    pub fn startup_time(&self) -> i64 {
        self.startup_time
    }

    /// Create a mapping for `req.remote_port`.
    ///
    /// A port held by a different agent is a conflict. A port held by the
    /// *same* agent is reclaimed: the old mapping is stopped first, then
    /// replaced — an agent that restarted re-registers long before its old
    /// record times out. On success the public listener is bound and its
    /// accept loop running before this returns.
    pub async fn create_mapping(&self, req: &PortMappingRequest) -> Result<(), CreateError> {
        let mut tables = self.tables.lock().await;

        if let Some(existing) = tables.mappings.get(&req.remote_port) {
            if existing.client_ip != req.client_ip {
                return Err(CreateError::Conflict(req.remote_port));
            }
            info!(
                client = %req.client_ip,
                port = req.remote_port,
                "client is reclaiming its own port, stopping old mapping"
            );
            if let Some(old) = tables.mappings.remove(&req.remote_port) {
                stop_mapping(old).await;
            }
            if let Some(agent) = tables.agents.get_mut(&req.client_ip) {
                agent.ports.remove(&req.remote_port);
            }
        }

        let listener = bind_public(req.remote_port).map_err(|source| CreateError::Bind {
            port: req.remote_port,
            source,
        })?;

        let (cancel, cancel_rx) = watch::channel(false);
        let target = SocketAddr::new(req.client_ip, req.client_port);
        let task = tokio::spawn(proxy::accept_loop(
            listener,
            req.remote_port,
            target,
            self.tunnel.clone(),
            self.pool.clone(),
            cancel_rx,
        ));

        tables.mappings.insert(
            req.remote_port,
            PortMapping {
                local_addr: req.local_addr.clone(),
                client_ip: req.client_ip,
                client_port: req.client_port,
                cancel,
                task,
            },
        );

        let agent = tables
            .agents
            .entry(req.client_ip)
            .or_insert_with(AgentRecord::new);
        agent.ports.insert(req.remote_port);
        // Counts as a sign of life, so a fresh registration is never evicted
        // before its first heartbeat.
        agent.last_heartbeat = Instant::now();

        info!(
            "created port mapping: external:{} -> {}:{} -> {}",
            req.remote_port, req.client_ip, req.client_port, req.local_addr
        );
        Ok(())
    }

    /// Delete the mapping for `port`. On success the listener is closed and
    /// the accept-loop task joined before this returns.
    pub async fn delete_mapping(&self, port: u16) -> Result<(), DeleteError> {
        let mut tables = self.tables.lock().await;

        let mapping = tables
            .mappings
            .remove(&port)
            .ok_or(DeleteError::NotFound(port))?;
        if let Some(agent) = tables.agents.get_mut(&mapping.client_ip) {
            agent.ports.remove(&port);
        }
        let local_addr = mapping.local_addr.clone();
        stop_mapping(mapping).await;

        info!(port, target = %local_addr, "deleted port mapping");
        Ok(())
    }

    /// Record a heartbeat, creating the agent record if needed. Heartbeats
    /// never create mappings.
    pub async fn heartbeat(&self, client_ip: IpAddr) {
        let mut tables = self.tables.lock().await;
        tables
            .agents
            .entry(client_ip)
            .or_insert_with(AgentRecord::new)
            .last_heartbeat = Instant::now();
    }

    /// Evict every agent whose last heartbeat is older than `deadline`,
    /// stopping all of its mappings. Returns the number of evicted agents.
    pub async fn evict_stale(&self, deadline: Duration) -> usize {
        let mut tables = self.tables.lock().await;
        let now = Instant::now();

        let dead: Vec<IpAddr> = tables
            .agents
            .iter()
            .filter(|(_, agent)| now.duration_since(agent.last_heartbeat) > deadline)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in &dead {
            let Some(agent) = tables.agents.remove(ip) else {
                continue;
            };
            let idle = now.duration_since(agent.last_heartbeat);
            warn!(
                "client {} appears to be dead (no heartbeat for {}), removing all mappings",
                ip,
                format_idle(idle)
            );
            for port in agent.ports {
                if let Some(mapping) = tables.mappings.remove(&port) {
                    stop_mapping(mapping).await;
                    info!(port, client = %ip, "removed stale port mapping");
                }
            }
        }

        dead.len()
    }

    /// Whether a mapping exists for `port`.
    pub async fn contains_mapping(&self, port: u16) -> bool {
        self.tables.lock().await.mappings.contains_key(&port)
    }

    /// Tunnel endpoint a mapping currently dials through.
    pub async fn mapping_target(&self, port: u16) -> Option<SocketAddr> {
        let tables = self.tables.lock().await;
        tables
            .mappings
            .get(&port)
            .map(|m| SocketAddr::new(m.client_ip, m.client_port))
    }

    /// Number of live mappings.
    pub async fn mapping_count(&self) -> usize {
        self.tables.lock().await.mappings.len()
    }

    /// Number of known agents.
    pub async fn agent_count(&self) -> usize {
        self.tables.lock().await.agents.len()
    }
}

/// Cancel a mapping's accept loop and wait for it to drop the listener, so
/// the port is observably closed when the caller replies.
async fn stop_mapping(mapping: PortMapping) {
    let _ = mapping.cancel.send(true);
    let _ = mapping.task.await;
}

/// Bind the public listener for a mapping.
///
/// `SO_REUSEADDR` lets a reclaimed port rebind while sockets from the old
/// mapping sit in TIME_WAIT.
fn bind_public(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;

    let std_listener: StdTcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
