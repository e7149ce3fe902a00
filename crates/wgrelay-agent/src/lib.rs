//! wgrelay agent
//!
//! The agent runs next to the services it exposes. For every configured
//! route it listens on a random tunnel port, registers the mapping with the
//! edge over the control API, and heartbeats every 20 seconds. Connections
//! arriving on a tunnel port are spliced onto the mapped local service.
//! A changed `server_startup_time` in a heartbeat reply means the edge
//! restarted and lost its in-memory registry, so every route is re-registered.

pub mod agent;
pub mod control;
pub mod routes;

pub use agent::{Agent, AgentError, HEARTBEAT_INTERVAL, MAX_HEARTBEAT_FAILURES};
pub use control::{ControlClient, ControlError};
pub use routes::{RouteError, RouteMapping, RouteSpec};
