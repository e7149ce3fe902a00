//! Control API
//!
//! Three JSON endpoints under `/api/v1`, served exclusively on the tunnel
//! interface — peer identity is enforced by WireGuard, so the API must never
//! be bound to a host-network address. Handlers serialize through the
//! registry mutex; a successful create reply means the public listener is
//! already accepting, a successful delete reply means it is already closed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::timeout::TimeoutLayer;
use tracing::warn;
use wgrelay_proto::{
    HeartbeatRequest, HeartbeatResponse, PortMappingRequest, PortMappingResponse, HEARTBEAT_PATH,
    PORT_MAPPINGS_PATH,
};
use wgrelay_tun::{BoxStream, TunnelListener, TunnelStack};

use crate::registry::{CreateError, DeleteError, Registry};

/// Per-request timeout on the control plane.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the control-plane router.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route(
            PORT_MAPPINGS_PATH,
            post(create_mapping).delete(delete_mapping),
        )
        .route(HEARTBEAT_PATH, post(heartbeat))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(registry)
}

/// Bind the control listener on the tunnel interface.
pub async fn bind(tunnel: &dyn TunnelStack, port: u16) -> io::Result<ControlListener> {
    let inner = tunnel.listen(port).await?;
    Ok(ControlListener { inner })
}

/// Serve the control API until the process exits.
pub async fn serve(listener: ControlListener, registry: Arc<Registry>) -> io::Result<()> {
    axum::serve(listener, router(registry)).await
}

/// Adapts a tunnel listener to `axum::serve`.
pub struct ControlListener {
    inner: Box<dyn TunnelListener>,
}

impl ControlListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl axum::serve::Listener for ControlListener {
    type Io = BoxStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok(pair) => return pair,
                Err(e) => {
                    warn!("control listener failed to accept: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn mapping_reply(
    status: StatusCode,
    success: bool,
    message: String,
) -> (StatusCode, Json<PortMappingResponse>) {
    (status, Json(PortMappingResponse { success, message }))
}

async fn create_mapping(
    State(registry): State<Arc<Registry>>,
    payload: Result<Json<PortMappingRequest>, JsonRejection>,
) -> (StatusCode, Json<PortMappingResponse>) {
    let Json(req) = match payload {
        Ok(body) => body,
        Err(e) => {
            return mapping_reply(
                StatusCode::BAD_REQUEST,
                false,
                format!("Invalid request body: {e}"),
            );
        }
    };

    match registry.create_mapping(&req).await {
        Ok(()) => mapping_reply(
            StatusCode::OK,
            true,
            format!("Port mapping created successfully for port {}", req.remote_port),
        ),
        Err(CreateError::Conflict(port)) => mapping_reply(
            StatusCode::CONFLICT,
            false,
            format!("Port {port} is already mapped by another client"),
        ),
        Err(CreateError::Bind { port, source }) => mapping_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            false,
            format!("Failed to listen on port {port}: {source}"),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    port: Option<String>,
}

async fn delete_mapping(
    State(registry): State<Arc<Registry>>,
    params: Result<Query<DeleteParams>, axum::extract::rejection::QueryRejection>,
) -> (StatusCode, Json<PortMappingResponse>) {
    let Ok(Query(params)) = params else {
        return mapping_reply(
            StatusCode::BAD_REQUEST,
            false,
            "Port parameter is required".to_string(),
        );
    };
    let Some(raw) = params.port else {
        return mapping_reply(
            StatusCode::BAD_REQUEST,
            false,
            "Port parameter is required".to_string(),
        );
    };
    let Ok(port) = raw.parse::<u16>() else {
        return mapping_reply(
            StatusCode::BAD_REQUEST,
            false,
            "Invalid port number".to_string(),
        );
    };

    match registry.delete_mapping(port).await {
        Ok(()) => mapping_reply(
            StatusCode::OK,
            true,
            format!("Port mapping deleted successfully for port {port}"),
        ),
        Err(DeleteError::NotFound(port)) => mapping_reply(
            StatusCode::NOT_FOUND,
            false,
            format!("No mapping found for port {port}"),
        ),
    }
}

async fn heartbeat(
    State(registry): State<Arc<Registry>>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> (StatusCode, Json<HeartbeatResponse>) {
    // The startup timestamp rides along on every reply, valid or not, so
    // agents can always detect a restart.
    let server_startup_time = registry.startup_time();

    match payload {
        Ok(Json(req)) => {
            registry.heartbeat(req.client_ip).await;
            (
                StatusCode::OK,
                Json(HeartbeatResponse {
                    success: true,
                    message: "Heartbeat received".to_string(),
                    server_startup_time,
                }),
            )
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(HeartbeatResponse {
                success: false,
                message: format!("Invalid request body: {e}"),
                server_startup_time,
            }),
        ),
    }
}
