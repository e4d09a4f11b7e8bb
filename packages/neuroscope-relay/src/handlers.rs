use crate::broadcast::TopicSnapshot;
use crate::relay::RelayMetricsSnapshot;
use crate::websocket::RelayState;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connected_clients: usize,
}

/// Relay statistics response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub topics: Vec<TopicSnapshot>,
    pub relay: RelayMetricsSnapshot,
    pub backpressure_threshold_bytes: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<RelayState>) -> (StatusCode, Json<HealthResponse>) {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        connected_clients: state.manager.total_clients(),
    };

    (StatusCode::OK, Json(response))
}

/// Per-topic client and drop counts plus relay counters
pub async fn stats(State(state): State<RelayState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        topics: state.manager.snapshot(),
        relay: state.metrics.snapshot(),
        backpressure_threshold_bytes: state.manager.backpressure_threshold(),
    })
}
