//! HTTP surface for health checks and observability

pub mod handlers;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{RelayError, Result};
use crate::relay::Relay;

pub use handlers::{HealthResponse, RelayState, StatsResponse};

/// Build the observability router
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

/// Serve the observability routes until the task is cancelled
pub async fn serve(relay: Arc<Relay>, config: &ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayError::Internal(format!("failed to bind {}: {}", addr, e)))?;

    info!("Observability server listening on {}", addr);

    axum::serve(listener, router(relay))
        .await
        .map_err(|e| RelayError::Internal(format!("server error: {}", e)))
}
