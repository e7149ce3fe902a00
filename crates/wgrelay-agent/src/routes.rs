//! Route specifications and tunnel-port assignment
//!
//! A route is given on the command line as `<localHost>:<localPort>-<remotePort>`,
//! e.g. `127.0.0.1:9000-18080` or `[fd00::1]:9000-18080`. The `-` separator
//! keeps the remote port unambiguous against IPv6 colons; the split happens at
//! the last `-` so hyphenated hostnames parse too.

use std::collections::HashSet;
use std::net::Ipv6Addr;
use std::str::FromStr;

use thiserror::Error;

/// Bottom of the random tunnel-port range.
pub const TUNNEL_PORT_MIN: u16 = 10_000;

/// Width of the random tunnel-port range; draws land in [10000, 60000).
pub const TUNNEL_PORT_RANGE: u16 = 50_000;

/// Draw attempts before giving up on finding an unused port.
const MAX_PORT_DRAWS: usize = 128;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route mapping {0:?}: expected <localHost>:<localPort>-<remotePort>")]
    Format(String),

    #[error("invalid local address in route mapping {0:?}")]
    LocalAddr(String),

    #[error("invalid remote port in route mapping {0:?}")]
    RemotePort(String),

    #[error("no unused tunnel port found after {MAX_PORT_DRAWS} draws")]
    PortsExhausted,
}

/// A parsed `-r` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Local service to forward to, normalized `host:port`.
    pub local_addr: String,
    /// Public port the edge should expose.
    pub remote_port: u16,
}

impl FromStr for RouteSpec {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((local, remote)) = s.rsplit_once('-') else {
            return Err(RouteError::Format(s.to_string()));
        };

        let remote_port: u16 = remote
            .trim()
            .parse()
            .map_err(|_| RouteError::RemotePort(s.to_string()))?;
        if remote_port == 0 {
            return Err(RouteError::RemotePort(s.to_string()));
        }

        let (host, local_port) =
            split_host_port(local.trim()).ok_or_else(|| RouteError::LocalAddr(s.to_string()))?;

        Ok(RouteSpec {
            local_addr: format!("{host}:{local_port}"),
            remote_port,
        })
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts. The returned host keeps
/// its brackets so it can be rejoined with a colon and dialed directly.
fn split_host_port(s: &str) -> Option<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        let port: u16 = rest.strip_prefix(':')?.parse().ok()?;
        Some((format!("[{host}]"), port))
    } else {
        let (host, port) = s.rsplit_once(':')?;
        if host.is_empty() || host.contains(':') {
            return None;
        }
        let port: u16 = port.parse().ok()?;
        Some((host.to_string(), port))
    }
}

/// A route with its assigned tunnel-local listen port.
#[derive(Debug, Clone)]
pub struct RouteMapping {
    pub local_addr: String,
    pub remote_port: u16,
    /// Random port this agent listens on inside the tunnel.
    pub client_port: u16,
}

/// Assign a distinct random tunnel port to every spec.
pub fn assign_tunnel_ports(specs: &[RouteSpec]) -> Result<Vec<RouteMapping>, RouteError> {
    let mut used = HashSet::new();
    specs
        .iter()
        .map(|spec| {
            let client_port = draw_tunnel_port(&used)?;
            used.insert(client_port);
            Ok(RouteMapping {
                local_addr: spec.local_addr.clone(),
                remote_port: spec.remote_port,
                client_port,
            })
        })
        .collect()
}

fn draw_tunnel_port(used: &HashSet<u16>) -> Result<u16, RouteError> {
    for _ in 0..MAX_PORT_DRAWS {
        let port = TUNNEL_PORT_MIN + rand::random::<u16>() % TUNNEL_PORT_RANGE;
        if !used.contains(&port) {
            return Ok(port);
        }
    }
    Err(RouteError::PortsExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_route() {
        let spec: RouteSpec = "127.0.0.1:9000-18080".parse().unwrap();
        assert_eq!(spec.local_addr, "127.0.0.1:9000");
        assert_eq!(spec.remote_port, 18080);
    }

    #[test]
    fn parses_bracketed_ipv6_route() {
        let spec: RouteSpec = "[fd00::1]:9000-18080".parse().unwrap();
        assert_eq!(spec.local_addr, "[fd00::1]:9000");
        assert_eq!(spec.remote_port, 18080);
    }

    #[test]
    fn parses_hyphenated_hostname() {
        let spec: RouteSpec = "db-replica:5432-15432".parse().unwrap();
        assert_eq!(spec.local_addr, "db-replica:5432");
        assert_eq!(spec.remote_port, 15432);
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(matches!(
            "127.0.0.1:9000".parse::<RouteSpec>(),
            Err(RouteError::Format(_))
        ));
        assert!(matches!(
            "127.0.0.1:9000-notaport".parse::<RouteSpec>(),
            Err(RouteError::RemotePort(_))
        ));
        assert!(matches!(
            "127.0.0.1:9000-0".parse::<RouteSpec>(),
            Err(RouteError::RemotePort(_))
        ));
        assert!(matches!(
            "9000-18080".parse::<RouteSpec>(),
            Err(RouteError::LocalAddr(_))
        ));
        // Unbracketed IPv6 hosts are ambiguous and refused.
        assert!(matches!(
            "fd00::1:9000-18080".parse::<RouteSpec>(),
            Err(RouteError::LocalAddr(_))
        ));
    }

    #[test]
    fn assigns_distinct_ports_in_range() {
        let specs: Vec<RouteSpec> = (1..=20)
            .map(|i| RouteSpec {
                local_addr: format!("127.0.0.1:{}", 9000 + i),
                remote_port: 18000 + i,
            })
            .collect();

        let mappings = assign_tunnel_ports(&specs).unwrap();
        let mut seen = HashSet::new();
        for mapping in &mappings {
            assert!(mapping.client_port >= TUNNEL_PORT_MIN);
            assert!(mapping.client_port < TUNNEL_PORT_MIN + TUNNEL_PORT_RANGE);
            assert!(seen.insert(mapping.client_port), "duplicate tunnel port");
        }
    }
}
