//! Request-governance middleware.
//!
//! Each stage is an ordinary `tower::Layer`; [`crate::pipeline::Pipeline`]
//! composes them in a fixed order:
//!
//! ```text
//! Request → Server header → Recovery → Deadline → Rate Limit → Circuit Breaker → Metrics → Request ID → Handler
//!                              ↓           ↓           ↓               ↓
//!                             500         504         429             503
//! ```
//!
//! - **Recovery**: catches panics anywhere below it
//! - **Deadline**: per-request time budget, propagated through extensions
//! - **Rate Limit**: global token bucket with lazy refill
//! - **Circuit Breaker**: failure score with cooldown, no half-open state
//! - **Metrics** / **Request ID**: observability hooks, never short-circuit

pub mod circuit_breaker;
pub mod deadline;
pub mod metrics;
pub mod rate_limit;
pub mod recover;
pub mod request_id;

pub use circuit_breaker::{
    Attempt, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitBreakerService,
    CircuitState,
};
pub use deadline::{
    DEFAULT_HOT_PATH_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, Deadline, DeadlineExceeded, DeadlineLayer,
    DeadlineService, MAX_REQUEST_TIMEOUT_MS, MIN_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_HEADER,
};
pub use metrics::{MetricsLayer, MetricsService};
pub use rate_limit::{Admission, RateLimitConfig, RateLimitLayer, RateLimitService, TokenBucket};
pub use recover::{RecoveryLayer, RecoveryService};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer, RequestIdService};
