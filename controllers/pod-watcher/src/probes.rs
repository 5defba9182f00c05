//! Liveness, readiness and metrics endpoints.
//!
//! - `GET /healthz` - 200 while the process is running
//! - `GET /readyz` - 200 once every watch loop has completed its first LIST
//! - `GET /metrics` - Prometheus text format

use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::metrics::Metrics;

/// Counts watch loops that have not yet completed their first LIST.
#[derive(Debug, Clone)]
pub struct Readiness {
    pending: Arc<AtomicUsize>,
}

impl Readiness {
    /// Readiness gate waiting for `watchers` watch loops
    pub fn new(watchers: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(watchers)),
        }
    }

    /// Marks one watch loop as ready. Call once per loop.
    pub fn mark_ready(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Whether every watch loop has listed at least once
    pub fn is_ready(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

/// Shared state of the probe server.
#[derive(Clone)]
pub struct ProbeState {
    /// Readiness gate
    pub readiness: Readiness,
    /// Metrics registry
    pub metrics: Metrics,
}

/// Builds the probe router.
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "waiting for initial pod list")
    }
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves the probe endpoints on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: ProbeState, shutdown: CancellationToken) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
