//! Application routing with the request-governance pipeline.
//!
//! # Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Pipeline     │ ← Server header, recovery (500), deadline (504),
//! │                  │   rate limit (429), circuit breaker (503),
//! │                  │   metrics, X-Request-Id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Hot-path deadline│ ← /echo only, tighter budget
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /healthz` - Liveness probe
//! - `GET /stats` - Pipeline and buffer pool statistics
//! - `POST /echo` - Hot-path echo

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::DeadlineLayer;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    info!(
        capacity = config.rate_limit_capacity,
        refill = config.rate_limit_refill,
        period_ms = config.rate_limit_period.as_millis(),
        failure_threshold = config.circuit_breaker_failure_threshold,
        cooldown_ms = config.circuit_breaker_cooldown.as_millis(),
        request_timeout_ms = config.request_timeout.as_millis(),
        hot_path_timeout_ms = config.hot_path_timeout.as_millis(),
        "Request pipeline configured"
    );

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/stats", get(handlers::stats))
        .route(
            "/echo",
            post(handlers::echo).route_layer(DeadlineLayer::new(config.hot_path_timeout)),
        )
        .layer(state.pipeline.clone())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
