//! The tunnel-network seam
//!
//! The registry, accept loops, and control client only ever see the
//! [`TunnelStack`] trait: listen on a tunnel port, dial a tunnel address,
//! streams are plain byte pipes. [`WgStack`] is the production implementation
//! over the `tokio-wireguard` in-process stack; [`HostStack`] runs the same
//! seam over the host loopback so integration tests can wire both peers
//! together without a WireGuard handshake.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_wireguard as wg;
use tokio_wireguard::interface::ToInterface;
use tokio_wireguard::x25519;
use tracing::debug;

use crate::config::WgConfig;

/// Capability set the splicer and the HTTP plumbing need from a stream.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// A tunnel-side connection of unspecified concrete type.
pub type BoxStream = Box<dyn TunnelStream>;

/// A listener bound to a tunnel address.
#[async_trait]
pub trait TunnelListener: Send {
    async fn accept(&mut self) -> io::Result<(BoxStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Virtual network the proxy runs on.
#[async_trait]
pub trait TunnelStack: Send + Sync {
    /// Bind a TCP listener on the stack's own address at `port`.
    async fn listen(&self, port: u16) -> io::Result<Box<dyn TunnelListener>>;

    /// Open a TCP connection to `addr`, which must be a tunnel address.
    async fn dial(&self, addr: SocketAddr) -> io::Result<BoxStream>;
}

/// Production stack: an in-process WireGuard interface.
///
/// All traffic through [`listen`](TunnelStack::listen) and
/// [`dial`](TunnelStack::dial) is encrypted and framed by the interface; the
/// only packets that touch the host network are WireGuard UDP datagrams.
/// Dropping the stack shuts the interface down.
pub struct WgStack {
    interface: wg::Interface,
    local_ip: IpAddr,
}

impl WgStack {
    /// Bring up a WireGuard interface from a parsed configuration.
    pub async fn up(config: &WgConfig) -> io::Result<Self> {
        let address = config
            .interface
            .addresses
            .first()
            .copied()
            .ok_or_else(|| io::Error::other("configuration has no interface address"))?;

        let wg_config = wg::Config {
            interface: wg::config::Interface {
                private_key: x25519::StaticSecret::from(config.interface.private_key),
                address: address
                    .to_string()
                    .parse()
                    .map_err(|_| io::Error::other(format!("interface address {address} rejected")))?,
                listen_port: config.interface.listen_port,
                mtu: Some(config.interface.mtu as _),
            },
            peers: vec![wg::config::Peer {
                public_key: x25519::PublicKey::from(config.peer.public_key),
                endpoint: config.peer.endpoint,
                allowed_ips: config
                    .peer
                    .allowed_ips
                    .iter()
                    .map(|cidr| cidr.to_string().parse())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| io::Error::other("allowed IP rejected"))?,
                persistent_keepalive: config.peer.persistent_keepalive,
            }],
        };

        let interface = wg_config
            .to_interface()
            .await
            .map_err(io::Error::other)?;

        debug!(address = %address, "WireGuard interface up");

        Ok(Self {
            interface,
            local_ip: address.addr,
        })
    }

    /// The interface's own tunnel address.
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }
}

#[async_trait]
impl TunnelStack for WgStack {
    async fn listen(&self, port: u16) -> io::Result<Box<dyn TunnelListener>> {
        let addr = SocketAddr::new(self.local_ip, port);
        let listener = wg::TcpListener::bind(addr, &self.interface)
            .await
            .map_err(io::Error::other)?;
        Ok(Box::new(WgListener { inner: listener }))
    }

    async fn dial(&self, addr: SocketAddr) -> io::Result<BoxStream> {
        let stream = wg::TcpStream::connect(addr, &self.interface)
            .await
            .map_err(io::Error::other)?;
        Ok(Box::new(stream))
    }
}

struct WgListener {
    inner: wg::TcpListener,
}

#[async_trait]
impl TunnelListener for WgListener {
    async fn accept(&mut self) -> io::Result<(BoxStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await.map_err(io::Error::other)?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr().map_err(io::Error::other)
    }
}

/// Test stack: the same seam over the host loopback.
///
/// Integration tests give each simulated peer its own loopback address
/// (127.0.0.1, 127.0.0.2, ...) and exercise the full control and data plane
/// without key material.
pub struct HostStack {
    ip: IpAddr,
}

impl HostStack {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }

    pub fn loopback() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl TunnelStack for HostStack {
    async fn listen(&self, port: u16) -> io::Result<Box<dyn TunnelListener>> {
        let listener = TcpListener::bind(SocketAddr::new(self.ip, port)).await?;
        Ok(Box::new(HostListener { inner: listener }))
    }

    async fn dial(&self, addr: SocketAddr) -> io::Result<BoxStream> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

struct HostListener {
    inner: TcpListener,
}

#[async_trait]
impl TunnelListener for HostListener {
    async fn accept(&mut self) -> io::Result<(BoxStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn host_stack_listen_and_dial() {
        let stack = HostStack::loopback();
        let mut listener = stack.listen(0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dial = tokio::spawn(async move {
            let stack = HostStack::loopback();
            let mut conn = stack.dial(addr).await.unwrap();
            conn.write_all(b"hi").await.unwrap();
            conn.shutdown().await.unwrap();
        });

        let (mut conn, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());

        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hi");

        dial.await.unwrap();
    }
}
