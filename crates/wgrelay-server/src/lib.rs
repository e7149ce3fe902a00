//! wgrelay edge
//!
//! The edge owns the registry of public-port to agent-endpoint bindings. It
//! serves the control API on the tunnel interface, runs one accept loop per
//! live mapping on the host network, and sweeps out agents whose heartbeats
//! have lapsed. Nothing is persisted; after a restart agents notice the new
//! startup timestamp in heartbeat replies and re-register.

pub mod api;
pub mod registry;
mod proxy;
pub mod sweeper;

pub use registry::{CreateError, DeleteError, Registry};
