//! WireGuard configuration and the tunnel-network seam
//!
//! Both wgrelay processes carry their entire control and data plane inside an
//! in-process WireGuard interface. This crate owns the pieces around that
//! interface: parsing wg-quick style configuration files, the [`TunnelStack`]
//! seam the proxy code listens and dials through, the production
//! [`WgStack`] adapter over `tokio-wireguard`, and the derivation of the
//! edge's tunnel address from an agent's own address.

pub mod addr;
pub mod config;
pub mod stack;

pub use addr::{derive_peer_addrs, AddrError};
pub use config::{Cidr, ConfigError, WgConfig};
pub use stack::{BoxStream, HostStack, TunnelListener, TunnelStack, TunnelStream, WgStack};
