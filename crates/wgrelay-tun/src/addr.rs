//! Edge tunnel-address derivation
//!
//! The agent does not learn the edge's tunnel address from anywhere; by
//! convention the edge takes the `.1` host of the agent's IPv4 /24, or
//! `prefix::1` for IPv6. The first address that yields a derivation wins.
//! Agents that run on unusual prefixes can bypass this with the explicit
//! `--server-ip` flag.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::config::Cidr;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("could not determine the edge tunnel address from the configured interface addresses")]
    Underivable,
}

/// Derive `(agent_addr, edge_addr)` from the agent's configured tunnel
/// addresses.
pub fn derive_peer_addrs(addresses: &[Cidr]) -> Result<(IpAddr, IpAddr), AddrError> {
    for cidr in addresses {
        match cidr.addr {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                let edge = Ipv4Addr::new(o[0], o[1], o[2], 1);
                return Ok((cidr.addr, IpAddr::V4(edge)));
            }
            IpAddr::V6(v6) => {
                // `prefix::1` built from the text before the first `::`.
                // Addresses without a compressed zero run are skipped.
                let text = v6.to_string();
                if let Some((prefix, _)) = text.split_once("::") {
                    if !prefix.is_empty() {
                        if let Ok(edge) = format!("{prefix}::1").parse::<Ipv6Addr>() {
                            return Ok((cidr.addr, IpAddr::V6(edge)));
                        }
                    }
                }
            }
        }
    }
    Err(AddrError::Underivable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn ipv4_edge_is_dot_one() {
        let (agent, edge) = derive_peer_addrs(&[cidr("10.6.0.7/24")]).unwrap();
        assert_eq!(agent, "10.6.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(edge, "10.6.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ipv6_edge_is_prefix_one() {
        let (agent, edge) = derive_peer_addrs(&[cidr("fd00:6::2/64")]).unwrap();
        assert_eq!(agent, "fd00:6::2".parse::<IpAddr>().unwrap());
        assert_eq!(edge, "fd00:6::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn first_parseable_address_wins() {
        let (agent, edge) =
            derive_peer_addrs(&[cidr("10.6.0.2/24"), cidr("fd00:6::2/64")]).unwrap();
        assert!(agent.is_ipv4());
        assert_eq!(edge, "10.6.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn skips_underivable_ipv6_and_falls_through() {
        // A fully expanded IPv6 address has no `::` to substitute on; the
        // following IPv4 address is used instead.
        let addrs = [cidr("1:2:3:4:5:6:7:8/64"), cidr("10.6.0.9/24")];
        let (_, edge) = derive_peer_addrs(&addrs).unwrap();
        assert_eq!(edge, "10.6.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(matches!(derive_peer_addrs(&[]), Err(AddrError::Underivable)));
    }
}
