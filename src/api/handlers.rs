//! Health, stats and metrics handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::dispatch::StatsSnapshot;
use crate::relay::Relay;

/// Shared state for the observability routes
pub type RelayState = Arc<Relay>;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_requests: usize,
    pub queued_requests: usize,
}

/// Dispatcher snapshot plus derived ratios
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub token_efficiency: f64,
    pub average_prompt_tokens: f64,
    pub average_completion_tokens: f64,
    pub average_total_tokens: f64,
    pub conversations: usize,
}

impl StatsResponse {
    pub fn new(snapshot: StatsSnapshot, conversations: usize) -> Self {
        Self {
            success_rate: snapshot.success_rate(),
            failure_rate: snapshot.failure_rate(),
            token_efficiency: snapshot.token_efficiency(),
            average_prompt_tokens: snapshot.average_prompt_tokens(),
            average_completion_tokens: snapshot.average_completion_tokens(),
            average_total_tokens: snapshot.average_total_tokens(),
            snapshot,
            conversations,
        }
    }
}

/// Liveness probe
///
/// GET /healthz
pub async fn health(State(relay): State<RelayState>) -> (StatusCode, Json<HealthResponse>) {
    let stats = relay.stats();
    let healthy = relay.is_healthy();
    if !healthy {
        warn!(
            active = stats.active_requests,
            queue = stats.queue_size,
            "Health check failed"
        );
    }

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            active_requests: stats.active_requests,
            queued_requests: stats.queued_requests,
        }),
    )
}

/// Usage statistics
///
/// GET /stats
pub async fn stats(State(relay): State<RelayState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(relay.stats(), relay.registry().len()))
}

/// Prometheus text exposition
///
/// GET /metrics
pub async fn metrics(State(relay): State<RelayState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        relay.metrics().export_prometheus(),
    )
}
