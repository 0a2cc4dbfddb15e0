//! Pipeline composer.
//!
//! [`Pipeline`] owns the shared state of the gating stages (one token bucket,
//! one circuit breaker) and is itself a `tower::Layer` that wraps a handler in
//! every stage, in a fixed order:
//!
//! ```text
//! SetResponseHeader(Server)
//!   └─ Recovery
//!       └─ Deadline
//!           └─ RateLimit
//!               └─ CircuitBreaker
//!                   └─ Metrics
//!                       └─ RequestId
//!                           └─ handler
//! ```
//!
//! Cloning a `Pipeline` shares its state; two pipelines built with
//! [`Pipeline::new`] are fully independent.
//!
//! # Example
//!
//! ```rust,ignore
//! let pipeline = Pipeline::new(PipelineConfig::default())?;
//! let app = Router::new()
//!     .route("/", get(handler))
//!     .layer(pipeline.clone());
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::http::header::SERVER;
use serde::Serialize;
use tower::{Layer, ServiceBuilder};
use tower_http::set_header::{SetResponseHeader, SetResponseHeaderLayer};

use crate::error::{AppError, AppResult};
use crate::middleware::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerLayer, CircuitBreakerService,
    CircuitState, DEFAULT_REQUEST_TIMEOUT, DeadlineLayer, DeadlineService, MetricsLayer,
    MetricsService, RateLimitConfig, RateLimitLayer, RateLimitService, RecoveryLayer,
    RecoveryService, RequestIdLayer, RequestIdService, TokenBucket,
};

/// Default value of the `Server` response header.
pub const DEFAULT_SERVER_HEADER: &str = "highperf-api";

/// Settings for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub server_header: String,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Budget of the generic deadline stage.
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            server_header: DEFAULT_SERVER_HEADER.to_string(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Point-in-time view of the pipeline's shared state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub tokens_available: u32,
    pub bucket_capacity: u32,
    pub requests_admitted: u64,
    pub requests_rate_limited: u64,
    pub circuit_state: CircuitState,
    pub failure_score: u32,
    pub circuit_times_opened: u32,
    pub circuit_requests_rejected: u64,
    pub circuit_cooldown_remaining_ms: u64,
}

/// The composed request-governance pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    server_header: HeaderValue,
    request_timeout: Duration,
    bucket: Arc<TokenBucket>,
    breaker: Arc<CircuitBreaker>,
}

/// Service produced by wrapping `S` in a [`Pipeline`].
pub type PipelineService<S> = SetResponseHeader<
    RecoveryService<
        DeadlineService<
            RateLimitService<CircuitBreakerService<MetricsService<RequestIdService<S>>>>,
        >,
    >,
    HeaderValue,
>;

impl Pipeline {
    /// Build a pipeline with fresh, unshared state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the server header is not a valid
    /// header value.
    pub fn new(config: PipelineConfig) -> AppResult<Self> {
        let server_header = HeaderValue::from_str(&config.server_header).map_err(|e| {
            AppError::ConfigError(format!(
                "Invalid SERVER_HEADER {:?}: {e}",
                config.server_header
            ))
        })?;

        Ok(Self {
            server_header,
            request_timeout: config.request_timeout,
            bucket: Arc::new(TokenBucket::new(config.rate_limit)),
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker)),
        })
    }

    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            tokens_available: self.bucket.available(),
            bucket_capacity: self.bucket.config().capacity,
            requests_admitted: self.bucket.admitted(),
            requests_rate_limited: self.bucket.rejected(),
            circuit_state: self.breaker.state(),
            failure_score: self.breaker.failure_score(),
            circuit_times_opened: self.breaker.times_opened(),
            circuit_requests_rejected: self.breaker.requests_rejected(),
            circuit_cooldown_remaining_ms: u64::try_from(
                self.breaker.remaining_cooldown().as_millis(),
            )
            .unwrap_or(u64::MAX),
        }
    }
}

impl<S> Layer<S> for Pipeline {
    type Service = PipelineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceBuilder::new()
            .layer(SetResponseHeaderLayer::overriding(
                SERVER,
                self.server_header.clone(),
            ))
            .layer(RecoveryLayer::new())
            .layer(DeadlineLayer::new(self.request_timeout))
            .layer(RateLimitLayer::new(self.bucket.clone()))
            .layer(CircuitBreakerLayer::new(self.breaker.clone()))
            .layer(MetricsLayer::new())
            .layer(RequestIdLayer::new())
            .service(inner)
    }
}
