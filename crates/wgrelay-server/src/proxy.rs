//! Public-side accept loop and dial-through
//!
//! One task per mapping accepts on the public listener and dials the agent's
//! tunnel endpoint for every connection; each connection pair gets its own
//! splicing task. The loop stops when the mapping's cancel channel fires;
//! accept errors after a cancel are expected and stay silent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};
use wgrelay_splice::{splice, BufferPool};
use wgrelay_tun::TunnelStack;

/// Pause after a transient accept failure so a broken listener cannot spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub(crate) async fn accept_loop(
    listener: TcpListener,
    remote_port: u16,
    target: SocketAddr,
    tunnel: Arc<dyn TunnelStack>,
    pool: Arc<BufferPool>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    let tunnel = tunnel.clone();
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        proxy_connection(conn, peer, remote_port, target, tunnel, pool).await;
                    });
                }
                Err(e) => {
                    if *cancel.borrow() {
                        break;
                    }
                    warn!(port = remote_port, "failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    debug!(port = remote_port, "accept loop stopped");
}

/// Dial the agent's tunnel endpoint and splice both directions to completion.
async fn proxy_connection(
    conn: TcpStream,
    peer: SocketAddr,
    remote_port: u16,
    target: SocketAddr,
    tunnel: Arc<dyn TunnelStack>,
    pool: Arc<BufferPool>,
) {
    let tunnel_conn = match tunnel.dial(target).await {
        Ok(c) => c,
        Err(e) => {
            warn!(
                port = remote_port,
                "failed to connect to client at {}: {}", target, e
            );
            return;
        }
    };

    debug!(%peer, port = remote_port, %target, "established proxy connection");
    let (to_agent, to_peer) = splice(conn, tunnel_conn, &pool).await;
    debug!(
        %peer,
        port = remote_port,
        %target,
        bytes_in = to_agent,
        bytes_out = to_peer,
        "proxy connection closed"
    );
}
