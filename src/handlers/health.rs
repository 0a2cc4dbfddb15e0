//! Liveness and statistics endpoints.
//!
//! - `GET /healthz` - Liveness probe, always `200 ok`
//! - `GET /stats` - Pipeline and buffer pool snapshot

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use tracing::instrument;

use crate::encoding::json_response;
use crate::error::AppResult;
use crate::models::StatsResponse;
use crate::state::AppState;

/// Liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}

/// Statistics endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "pipeline": {
///     "tokens_available": 998,
///     "bucket_capacity": 1000,
///     "requests_admitted": 2,
///     "requests_rate_limited": 0,
///     "circuit_state": "closed",
///     "failure_score": 0,
///     "circuit_times_opened": 0,
///     "circuit_requests_rejected": 0,
///     "circuit_cooldown_remaining_ms": 0
///   },
///   "buffer_pool": { "idle": 1, "allocated": 1, "reused": 1, "discarded_oversize": 0 },
///   "uptime_seconds": 3600,
///   "version": "0.1.0",
///   "timestamp": "2026-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> AppResult<Response> {
    let body = StatsResponse {
        pipeline: state.pipeline.snapshot(),
        buffer_pool: state.pool.stats(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    json_response(&state.pool, StatusCode::OK, &body)
}
