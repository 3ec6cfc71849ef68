//! Liveness and readiness probes
//!
//! - `GET /healthz` - always `ok` while the process serves HTTP
//! - `GET /readyz` - `ok` once controllers are running, 503 before

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::{error, info};

/// Shared readiness flag
#[derive(Clone, Debug, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Create a flag that starts not ready
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip readiness
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    /// Current readiness
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Build the probe router
pub fn health_routes(readiness: Readiness) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(readiness)
}

async fn readyz(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve the probes until the process exits
pub async fn start_health_server(addr: SocketAddr, readiness: Readiness) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => {
            info!(addr = %addr, "health probe server started");
            l
        }
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind health probe address");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, health_routes(readiness)).await {
        error!(error = %e, "health probe server error");
    }
}
