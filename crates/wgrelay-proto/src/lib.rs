//! Control-plane wire types
//!
//! The edge serves a small JSON API on a well-known TCP port inside the
//! WireGuard tunnel. Agents register port mappings, delete them on shutdown,
//! and send periodic heartbeats. These are the request/response bodies shared
//! by both sides.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// TCP port the control API listens on inside the tunnel.
pub const CONTROL_PORT: u16 = 80;

/// Path of the port-mapping endpoint (POST to create, DELETE with `?port=N`).
pub const PORT_MAPPINGS_PATH: &str = "/api/v1/port-mappings";

/// Path of the heartbeat endpoint.
pub const HEARTBEAT_PATH: &str = "/api/v1/heartbeat";

/// Request to create a port mapping.
///
/// `client_ip`/`client_port` name the tunnel-side endpoint the edge dials for
/// every accepted public connection. `local_addr` is the agent's final
/// destination and is informational only for the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMappingRequest {
    /// Final destination on the agent side, `host:port`.
    pub local_addr: String,
    /// Public TCP port to expose on the edge.
    pub remote_port: u16,
    /// Agent address within the tunnel.
    pub client_ip: IpAddr,
    /// Tunnel port the agent listens on for this mapping.
    pub client_port: u16,
}

/// Response to a port-mapping create or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMappingResponse {
    pub success: bool,
    pub message: String,
}

/// Heartbeat from an agent, identifying it by its tunnel address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub client_ip: IpAddr,
}

/// Heartbeat reply.
///
/// `server_startup_time` (seconds since the Unix epoch, captured once when the
/// edge process starts) is present in every reply, success or failure. Agents
/// compare it across heartbeats to detect an edge restart and re-register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub message: String,
    pub server_startup_time: i64,
}
