//! wg-quick configuration parsing
//!
//! Accepts the INI-like `[Interface]` / `[Peer]` format. Keys the WireGuard
//! stack does not need (`DNS`, `Table`, ...) are ignored. Base64 key material
//! is decoded once into 32-byte arrays; endpoints with hostnames are resolved
//! at parse time.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

/// Default interface MTU when the config does not set one.
pub const DEFAULT_MTU: usize = 1420;

/// Default WireGuard endpoint port when the config omits it.
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Errors produced while loading or parsing a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("missing required key {0}")]
    MissingKey(&'static str),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to resolve endpoint {0}")]
    Endpoint(String),
}

/// An IP address with a prefix length, e.g. `10.6.0.2/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = String;

    /// Parse `addr/prefix`; a bare address is promoted to a host route
    /// (`/32` for IPv4, `/128` for IPv6).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };

        let addr: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| format!("invalid IP address {addr_part:?}"))?;

        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix_part {
            None => max,
            Some(p) => {
                let prefix: u8 = p
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid prefix length {p:?}"))?;
                if prefix > max {
                    return Err(format!("prefix /{prefix} out of range for {addr}"));
                }
                prefix
            }
        };

        Ok(Cidr { addr, prefix })
    }
}

/// Parsed `[Interface]` section.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub private_key: [u8; 32],
    /// Tunnel addresses, in file order. Dual-stack configs list both.
    pub addresses: Vec<Cidr>,
    pub listen_port: Option<u16>,
    pub mtu: usize,
}

/// Parsed `[Peer]` section.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub allowed_ips: Vec<Cidr>,
    /// Resolved peer endpoint. The edge typically has none and waits for the
    /// agent to initiate.
    pub endpoint: Option<SocketAddr>,
    /// `None` when the config sets 0 or omits the key.
    pub persistent_keepalive: Option<u16>,
}

/// A complete WireGuard configuration: one interface, one peer.
#[derive(Debug, Clone)]
pub struct WgConfig {
    pub interface: InterfaceConfig,
    pub peer: PeerConfig,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Interface,
    Peer,
}

impl WgConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut section = Section::Preamble;

        let mut private_key = None;
        let mut addresses = Vec::new();
        let mut listen_port = None;
        let mut mtu = DEFAULT_MTU;

        let mut public_key = None;
        let mut allowed_ips = Vec::new();
        let mut endpoint = None;
        let mut persistent_keepalive = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.eq_ignore_ascii_case("[interface]") {
                section = Section::Interface;
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                section = Section::Peer;
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match section {
                Section::Interface => match key {
                    "PrivateKey" => private_key = Some(decode_key("PrivateKey", value)?),
                    "Address" => {
                        for part in value.split(',') {
                            addresses.push(parse_cidr("Address", part)?);
                        }
                    }
                    "ListenPort" => listen_port = Some(parse_num("ListenPort", value)?),
                    "MTU" => mtu = parse_num("MTU", value)?,
                    _ => {}
                },
                Section::Peer => match key {
                    "PublicKey" => public_key = Some(decode_key("PublicKey", value)?),
                    "AllowedIPs" => {
                        for part in value.split(',') {
                            allowed_ips.push(parse_cidr("AllowedIPs", part)?);
                        }
                    }
                    "Endpoint" => endpoint = Some(resolve_endpoint(value)?),
                    "PersistentKeepalive" => {
                        let secs: u16 = parse_num("PersistentKeepalive", value)?;
                        persistent_keepalive = (secs > 0).then_some(secs);
                    }
                    _ => {}
                },
                Section::Preamble => {}
            }
        }

        if addresses.is_empty() {
            return Err(ConfigError::MissingKey("Address"));
        }

        Ok(WgConfig {
            interface: InterfaceConfig {
                private_key: private_key.ok_or(ConfigError::MissingKey("PrivateKey"))?,
                addresses,
                listen_port,
                mtu,
            },
            peer: PeerConfig {
                public_key: public_key.ok_or(ConfigError::MissingKey("PublicKey"))?,
                allowed_ips,
                endpoint,
                persistent_keepalive,
            },
        })
    }
}

fn decode_key(key: &'static str, value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|e| ConfigError::Invalid {
        key,
        reason: format!("not valid base64: {e}"),
    })?;
    bytes.try_into().map_err(|_| ConfigError::Invalid {
        key,
        reason: "decoded key is not 32 bytes".to_string(),
    })
}

fn parse_cidr(key: &'static str, value: &str) -> Result<Cidr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|reason| ConfigError::Invalid { key, reason })
}

fn parse_num<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("invalid number {value:?}"),
    })
}

/// Resolve an `Endpoint` value to a socket address.
///
/// Accepts `ip:port`, a bare IP, `host:port`, or a bare hostname; the port
/// defaults to 51820 when omitted. Hostnames are resolved here, once, so the
/// tunnel only ever deals in addresses.
fn resolve_endpoint(value: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(sa) = value.parse::<SocketAddr>() {
        return Ok(sa);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_LISTEN_PORT));
    }

    let (host, port) = match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "Endpoint",
                reason: format!("invalid port in {value:?}"),
            })?;
            (host, port)
        }
        _ => (value, DEFAULT_LISTEN_PORT),
    };

    (host, port)
        .to_socket_addrs()
        .map_err(|_| ConfigError::Endpoint(value.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::Endpoint(value.to_string()))
}
