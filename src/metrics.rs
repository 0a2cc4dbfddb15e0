//! Prometheus metrics for application observability.
//!
//! Metrics are recorded through the `metrics` facade and exposed by the
//! Prometheus exporter's own HTTP listener (default: `0.0.0.0:9090`). Until
//! [`init_metrics`] installs a recorder, every call here is a cheap no-op,
//! which keeps unit tests free of global setup.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `highperf_requests_total` - Requests that reached the handler (labels: route, method, status)
//! - `highperf_rate_limited_total` - Requests rejected by admission control
//! - `highperf_circuit_breaker_opens_total` - Times the circuit breaker opened
//! - `highperf_circuit_breaker_rejections_total` - Requests rejected by the open circuit
//! - `highperf_deadline_exceeded_total` - Requests answered 504 by a deadline guard
//! - `highperf_panics_recovered_total` - Panics caught by the recovery guard
//! - `highperf_buffer_pool_discards_total` - Oversized buffers dropped instead of pooled
//!
//! ## Histograms
//! - `highperf_request_duration_seconds` - Handler latency (labels: route, method, status)
//!
//! ## Gauges
//! - `highperf_rate_limit_tokens_available` - Tokens left in the bucket
//! - `highperf_circuit_breaker_state` - 0 = closed, 1 = open
//! - `highperf_buffer_pool_idle` - Idle buffers held by the pool

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::middleware::CircuitState;

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "highperf_requests_total";
    pub const RATE_LIMITED_TOTAL: &str = "highperf_rate_limited_total";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "highperf_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "highperf_circuit_breaker_rejections_total";
    pub const DEADLINE_EXCEEDED_TOTAL: &str = "highperf_deadline_exceeded_total";
    pub const PANICS_RECOVERED_TOTAL: &str = "highperf_panics_recovered_total";
    pub const BUFFER_POOL_DISCARDS_TOTAL: &str = "highperf_buffer_pool_discards_total";
    pub const REQUEST_DURATION_SECONDS: &str = "highperf_request_duration_seconds";
    pub const RATE_LIMIT_TOKENS_AVAILABLE: &str = "highperf_rate_limit_tokens_available";
    pub const CIRCUIT_BREAKER_STATE: &str = "highperf_circuit_breaker_state";
    pub const BUFFER_POOL_IDLE: &str = "highperf_buffer_pool_idle";
}

/// Install the Prometheus exporter listening on `metrics_addr` and describe
/// every metric.
///
/// # Errors
///
/// Returns `AppError::Internal` if the exporter cannot be installed (address
/// in use, or a recorder is already set).
pub fn init_metrics(metrics_addr: SocketAddr) -> AppResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| AppError::Internal(format!("Failed to install Prometheus exporter: {e}")))?;

    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of requests that reached the handler"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Total number of requests rejected by admission control"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times the circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of requests rejected by circuit breaker"
    );
    describe_counter!(
        names::DEADLINE_EXCEEDED_TOTAL,
        "Total number of requests that ran out of time budget"
    );
    describe_counter!(
        names::PANICS_RECOVERED_TOTAL,
        "Total number of handler panics caught by the recovery guard"
    );
    describe_counter!(
        names::BUFFER_POOL_DISCARDS_TOTAL,
        "Total number of oversized buffers discarded instead of pooled"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(
        names::RATE_LIMIT_TOKENS_AVAILABLE,
        "Tokens currently available in the admission bucket"
    );
    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = open)"
    );
    describe_gauge!(
        names::BUFFER_POOL_IDLE,
        "Idle buffers currently held by the pool"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record a request that reached the handler, with its latency.
pub fn record_request(route: &str, method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(names::REQUESTS_TOTAL, "route" => route.to_string(), "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "route" => route.to_string(), "method" => method.to_string(), "status" => status)
        .record(duration_secs);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

pub fn record_circuit_opened() {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL).increment(1);
}

pub fn record_circuit_rejected() {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
}

pub fn record_deadline_exceeded() {
    counter!(names::DEADLINE_EXCEEDED_TOTAL).increment(1);
}

pub fn record_panic_recovered() {
    counter!(names::PANICS_RECOVERED_TOTAL).increment(1);
}

pub fn record_buffer_discarded() {
    counter!(names::BUFFER_POOL_DISCARDS_TOTAL).increment(1);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_tokens_available(tokens: u32) {
    gauge!(names::RATE_LIMIT_TOKENS_AVAILABLE).set(f64::from(tokens));
}

pub fn set_circuit_state(state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::Open => 1.0,
    };
    gauge!(names::CIRCUIT_BREAKER_STATE).set(value);
}

pub fn set_buffer_pool_idle(idle: usize) {
    gauge!(names::BUFFER_POOL_IDLE).set(idle as f64);
}
