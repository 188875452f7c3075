//! HTTP server hosting the gate in front of a placeholder API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{enforce, Gate};
use crate::error::{GuardError, Result};

/// Build the router: every route sits behind the gate.
pub fn build_router(gate: Arc<Gate>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(echo)
        .layer(middleware::from_fn_with_state(gate, enforce))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "version": env!("CARGO_PKG_VERSION") }))
}

/// Stand-in for the protected application.
async fn echo(request: Request) -> Json<Value> {
    Json(json!({
        "success": true,
        "method": request.method().as_str(),
        "path": request.uri().path(),
    }))
}

/// HTTP server for the gate.
pub struct GateServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The gate instance
    gate: Arc<Gate>,
}

impl GateServer {
    /// Create a new server for the gate.
    pub fn new(addr: SocketAddr, gate: Arc<Gate>) -> Self {
        Self { addr, gate }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = build_router(self.gate);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GuardError::Io(e)
        })
    }
}
