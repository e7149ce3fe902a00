//! Control-plane client
//!
//! Talks HTTP/1.1 to the edge's control API over streams dialed through the
//! tunnel. Each request opens its own connection — the control plane sees a
//! handful of requests per minute, so there is nothing worth pooling.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use wgrelay_proto::{
    HeartbeatRequest, HeartbeatResponse, PortMappingRequest, PortMappingResponse, HEARTBEAT_PATH,
    PORT_MAPPINGS_PATH,
};
use wgrelay_tun::TunnelStack;

use crate::routes::RouteMapping;

/// Timeout covering dial, request, and response for one control call.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to reach the control endpoint: {0}")]
    Dial(#[source] io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("invalid response body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("server error: {0}")]
    Server(String),

    #[error("control request timed out")]
    Timeout,
}

/// Client for the edge's control API.
pub struct ControlClient {
    tunnel: Arc<dyn TunnelStack>,
    server: SocketAddr,
    client_ip: IpAddr,
}

impl ControlClient {
    /// `server` is the edge's control endpoint inside the tunnel;
    /// `client_ip` is this agent's own tunnel address, sent with every
    /// registration and heartbeat.
    pub fn new(tunnel: Arc<dyn TunnelStack>, server: SocketAddr, client_ip: IpAddr) -> Self {
        Self {
            tunnel,
            server,
            client_ip,
        }
    }

    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    /// Register a port mapping with the edge.
    pub async fn register(&self, mapping: &RouteMapping) -> Result<(), ControlError> {
        let body = PortMappingRequest {
            local_addr: mapping.local_addr.clone(),
            remote_port: mapping.remote_port,
            client_ip: self.client_ip,
            client_port: mapping.client_port,
        };

        let (_, resp): (_, PortMappingResponse) =
            self.post_json(PORT_MAPPINGS_PATH, &body).await?;
        if !resp.success {
            return Err(ControlError::Server(resp.message));
        }

        info!(
            "registered port mapping: remote port {} -> client port {}",
            mapping.remote_port, mapping.client_port
        );
        Ok(())
    }

    /// Delete a port mapping. A 404 means the edge already dropped it
    /// (eviction or restart) and is not an error.
    pub async fn delete(&self, remote_port: u16) -> Result<(), ControlError> {
        let uri = format!("{PORT_MAPPINGS_PATH}?port={remote_port}");
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .header(header::HOST, self.server.to_string())
            .body(Full::new(Bytes::new()))?;

        let (status, resp): (_, PortMappingResponse) = self.send(request).await?;
        if status == StatusCode::NOT_FOUND {
            debug!(port = remote_port, "mapping already gone on the server");
            return Ok(());
        }
        if !resp.success {
            return Err(ControlError::Server(resp.message));
        }

        info!("deleted port mapping for remote port {}", remote_port);
        Ok(())
    }

    /// Send a heartbeat; returns the server's startup timestamp.
    pub async fn heartbeat(&self) -> Result<i64, ControlError> {
        let body = HeartbeatRequest {
            client_ip: self.client_ip,
        };

        let (_, resp): (_, HeartbeatResponse) = self.post_json(HEARTBEAT_PATH, &body).await?;
        if !resp.success {
            return Err(ControlError::Server(resp.message));
        }
        Ok(resp.server_startup_time)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, T), ControlError> {
        let bytes = serde_json::to_vec(body)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::HOST, self.server.to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(bytes)))?;
        self.send(request).await
    }

    /// Dial through the tunnel, run one HTTP/1.1 exchange, decode the JSON
    /// body. The whole exchange shares a single deadline.
    async fn send<T: DeserializeOwned>(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<(StatusCode, T), ControlError> {
        let exchange = async {
            let stream = self
                .tunnel
                .dial(self.server)
                .await
                .map_err(ControlError::Dial)?;

            let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("control connection closed: {}", e);
                }
            });

            let response = sender.send_request(request).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            let value = serde_json::from_slice(&body)?;
            Ok((status, value))
        };

        tokio::time::timeout(CONTROL_TIMEOUT, exchange)
            .await
            .map_err(|_| ControlError::Timeout)?
    }
}
