//! End-to-end: real agent against the real edge over the loopback seam.
//!
//! Covers the echo scenario, edge restart with re-registration, and graceful
//! agent cleanup — the full life of a mapping short of actual WireGuard
//! framing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wgrelay_agent::{Agent, ControlClient, RouteSpec};
use wgrelay_server::{api, Registry};
use wgrelay_splice::BufferPool;
use wgrelay_tun::{HostStack, TunnelStack};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = conn.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

fn new_registry(tunnel: &Arc<dyn TunnelStack>) -> Arc<Registry> {
    Arc::new(Registry::new(tunnel.clone(), Arc::new(BufferPool::default())))
}

fn new_agent(control_addr: SocketAddr, specs: &[RouteSpec]) -> Arc<Agent> {
    let tunnel: Arc<dyn TunnelStack> = Arc::new(HostStack::loopback());
    let control = ControlClient::new(tunnel.clone(), control_addr, "127.0.0.1".parse().unwrap());
    Arc::new(Agent::new(tunnel, control, Arc::new(BufferPool::default()), specs).unwrap())
}

async fn echo_roundtrip(public_port: u16) {
    let mut conn = TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    conn.write_all(b"hello\n").await.unwrap();

    let mut got = [0u8; 6];
    conn.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"hello\n");

    conn.shutdown().await.unwrap();
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn agent_exposes_local_echo_service() {
    let tunnel: Arc<dyn TunnelStack> = Arc::new(HostStack::loopback());
    let registry = new_registry(&tunnel);
    let listener = api::bind(tunnel.as_ref(), 0).await.unwrap();
    let control_addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(listener, registry.clone()));

    let echo = spawn_echo().await;
    let public_port = free_port().await;
    let agent = new_agent(
        control_addr,
        &[RouteSpec {
            local_addr: echo.to_string(),
            remote_port: public_port,
        }],
    );

    agent.probe().await.unwrap();
    agent.start().await.unwrap();
    assert!(registry.contains_mapping(public_port).await);

    echo_roundtrip(public_port).await;
}

#[tokio::test]
async fn edge_restart_is_recovered_by_reregistration() {
    let tunnel: Arc<dyn TunnelStack> = Arc::new(HostStack::loopback());

    // First edge.
    let registry1 = new_registry(&tunnel);
    let listener = api::bind(tunnel.as_ref(), 0).await.unwrap();
    let control_addr = listener.local_addr().unwrap();
    let serve1 = tokio::spawn(api::serve(listener, registry1.clone()));

    let echo = spawn_echo().await;
    let public_port = free_port().await;
    let agent = new_agent(
        control_addr,
        &[RouteSpec {
            local_addr: echo.to_string(),
            remote_port: public_port,
        }],
    );

    agent.probe().await.unwrap();
    agent.start().await.unwrap();
    assert!(registry1.contains_mapping(public_port).await);

    // The edge dies, taking its registry and public listener with it.
    serve1.abort();
    let _ = serve1.await;
    registry1.delete_mapping(public_port).await.unwrap();

    // The startup timestamp has one-second resolution; make sure the
    // replacement edge gets a different one.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let registry2 = new_registry(&tunnel);
    assert_ne!(registry1.startup_time(), registry2.startup_time());
    let listener = api::bind(tunnel.as_ref(), control_addr.port()).await.unwrap();
    tokio::spawn(api::serve(listener, registry2.clone()));

    // The next heartbeat sees the new startup time and re-registers.
    agent.heartbeat_now().await.unwrap();
    assert!(registry2.contains_mapping(public_port).await);

    // Traffic flows again through the same public port.
    echo_roundtrip(public_port).await;
}

#[tokio::test]
async fn graceful_cleanup_deletes_all_mappings() {
    let tunnel: Arc<dyn TunnelStack> = Arc::new(HostStack::loopback());
    let registry = new_registry(&tunnel);
    let listener = api::bind(tunnel.as_ref(), 0).await.unwrap();
    let control_addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(listener, registry.clone()));

    let echo = spawn_echo().await;
    let port_a = free_port().await;
    let port_b = free_port().await;
    let agent = new_agent(
        control_addr,
        &[
            RouteSpec {
                local_addr: echo.to_string(),
                remote_port: port_a,
            },
            RouteSpec {
                local_addr: echo.to_string(),
                remote_port: port_b,
            },
        ],
    );

    agent.probe().await.unwrap();
    agent.start().await.unwrap();
    assert_eq!(registry.mapping_count().await, 2);

    agent.cleanup().await;
    assert_eq!(registry.mapping_count().await, 0);

    // Both ports are immediately reusable by another agent.
    let other = ControlClient::new(
        Arc::new(HostStack::loopback()),
        control_addr,
        "127.0.0.2".parse().unwrap(),
    );
    other
        .register(&wgrelay_agent::RouteMapping {
            local_addr: "127.0.0.1:9000".to_string(),
            remote_port: port_a,
            client_port: 40200,
        })
        .await
        .unwrap();
}
