//! Circuit breaker for failure containment.
//!
//! The circuit breaker prevents request pile-up while the downstream handler is
//! failing, by rejecting calls outright for a cooldown period. This reduces
//! load on the failing dependency and gives it room to recover.
//!
//! # States
//!
//! ```text
//!              score reaches threshold
//!   ┌─────────┐ ─────────────────────► ┌─────────┐
//!   │ Closed  │                        │  Open   │  every request: 503
//!   │(Normal) │ ◄───────────────────── │ (Fail   │
//!   └─────────┘    cooldown elapsed    │  Fast)  │
//!                                      └─────────┘
//! ```
//!
//! There is no half-open probe state. Once the cooldown has elapsed the next
//! request is admitted unconditionally and the circuit is closed again.
//!
//! # Failure score
//!
//! - A failure (status >= 500, an inner service error, a panic, or an attempt
//!   dropped because its request deadline passed) adds 1.
//! - An attempt dropped for any other reason, such as the client going away,
//!   is released without scoring.
//! - A success subtracts `decay`, floored at 0.
//! - When the score reaches `failure_threshold` the circuit opens for
//!   `cooldown` and the score resets to 0.
//!
//! The state lock is never held while the downstream handler runs.
//!
//! # Usage
//!
//! ```rust,ignore
//! let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
//!
//! let attempt = cb.try_begin()?;
//! let response = handler(req).await;
//! attempt.finish(response.status());
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::metrics;
use crate::middleware::deadline::Deadline;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Normal operation - all requests pass through.
    Closed,
    /// Failing fast - all requests are rejected immediately.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failure score at which the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open.
    pub cooldown: Duration,
    /// Amount a success subtracts from the failure score.
    pub decay: u32,
    /// Upper bound (exclusive) of the random delay before each admitted call.
    /// Zero disables jitter.
    pub jitter_max: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 20,
            cooldown: Duration::from_secs(2),
            decay: 2,
            jitter_max: Duration::from_millis(1),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration without jitter.
    pub fn new(failure_threshold: u32, cooldown: Duration, decay: u32) -> Self {
        Self {
            failure_threshold,
            cooldown,
            decay,
            jitter_max: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }
}

#[derive(Debug)]
struct BreakerState {
    failure_score: u32,
    open_until: Option<Instant>,
}

/// Thread-safe circuit breaker implementation.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    /// Total number of times the circuit has been opened (for metrics).
    times_opened: AtomicU32,
    /// Total number of requests rejected due to open circuit (for metrics).
    requests_rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                failure_score: 0,
                open_until: None,
            }),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a request may be dispatched.
    ///
    /// While open this returns `AppError::CircuitOpen` with the cooldown left.
    /// The first check after the cooldown closes the circuit and passes.
    pub fn allow_request(&self) -> Result<(), AppError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let open_until = state.open_until;

        match open_until {
            Some(until) if now < until => {
                drop(state);
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                Err(AppError::CircuitOpen {
                    remaining: until - now,
                })
            }
            Some(_) => {
                state.open_until = None;
                drop(state);
                info!("Circuit breaker cooldown elapsed, closing");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Check the circuit and, if admitted, start tracking an attempt.
    ///
    /// Finish the returned guard with the outcome. See [`Attempt`] for what
    /// happens when it is dropped unfinished.
    pub fn try_begin(self: &Arc<Self>) -> Result<Attempt, AppError> {
        self.allow_request()?;
        Ok(Attempt {
            breaker: Some(self.clone()),
            deadline: None,
        })
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failure_score = state.failure_score.saturating_sub(self.config.decay);
    }

    /// Record a failed call, opening the circuit when the score reaches the
    /// threshold.
    pub fn record_failure(&self) {
        let opened = {
            let mut state = self.state.lock();
            state.failure_score = state.failure_score.saturating_add(1);
            debug!(
                failure_score = state.failure_score,
                threshold = self.config.failure_threshold,
                "Circuit breaker recorded failure"
            );

            if state.failure_score >= self.config.failure_threshold {
                state.open_until = Some(Instant::now() + self.config.cooldown);
                state.failure_score = 0;
                true
            } else {
                false
            }
        };

        if opened {
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            metrics::record_circuit_opened();
            warn!(
                threshold = self.config.failure_threshold,
                cooldown = ?self.config.cooldown,
                "Circuit breaker opened"
            );
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        match self.state.lock().open_until {
            Some(until) if Instant::now() < until => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    /// Current failure score.
    pub fn failure_score(&self) -> u32 {
        self.state.lock().failure_score
    }

    /// Cooldown left while open, zero when closed.
    pub fn remaining_cooldown(&self) -> Duration {
        self.state
            .lock()
            .open_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Get the number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Get the number of requests rejected due to open circuit.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    /// Random dispatch delay in `[0, jitter_max)`.
    pub fn jitter(&self) -> Duration {
        let max = u64::try_from(self.config.jitter_max.as_micros()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..max))
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// One admitted call through the breaker.
///
/// Finish it with [`Attempt::finish`], [`Attempt::succeeded`] or
/// [`Attempt::failed`]. Dropping it unfinished counts as a failure only when
/// the bound [`Deadline`] has elapsed; otherwise the caller gave up and the
/// attempt is released unscored.
#[derive(Debug)]
#[must_use = "an unfinished attempt is only scored if its deadline elapsed"]
pub struct Attempt {
    breaker: Option<Arc<CircuitBreaker>>,
    deadline: Option<Deadline>,
}

impl Attempt {
    /// Tie the attempt to the request deadline it runs under.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Classify by response status: 5xx is a failure, anything else a success.
    pub fn finish(self, status: StatusCode) {
        if status.is_server_error() {
            self.failed();
        } else {
            self.succeeded();
        }
    }

    pub fn succeeded(mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.record_success();
        }
    }

    pub fn failed(mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.record_failure();
        }
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        let Some(breaker) = self.breaker.take() else {
            return;
        };

        if self.deadline.as_ref().is_some_and(Deadline::has_elapsed) {
            debug!("Attempt abandoned at its deadline");
            breaker.record_failure();
        } else {
            debug!("Attempt abandoned by the caller, not scored");
        }
    }
}

/// Circuit breaker layer for Tower middleware stack.
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: self.breaker.clone(),
        }
    }
}

/// Circuit breaker service wrapper.
#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> Service<Request<Body>> for CircuitBreakerService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let attempt = match self.breaker.try_begin() {
            Ok(attempt) => attempt,
            Err(rejection) => {
                warn!(
                    method = %req.method(),
                    path = %req.uri().path(),
                    "Circuit open, rejecting request"
                );
                metrics::record_circuit_rejected();
                return Box::pin(async move { Ok(rejection.into_response()) });
            }
        };

        let attempt = match req.extensions().get::<Deadline>() {
            Some(deadline) => attempt.with_deadline(deadline.clone()),
            None => attempt,
        };
        let jitter = self.breaker.jitter();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !jitter.is_zero() {
                tokio::time::sleep(jitter).await;
            }

            // Score the panic here, then let the recovery stage answer it
            let outcome = AssertUnwindSafe(async move { inner.call(req).await })
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(response)) => {
                    attempt.finish(response.status());
                    Ok(response)
                }
                Ok(Err(e)) => {
                    attempt.failed();
                    Err(e)
                }
                Err(payload) => {
                    attempt.failed();
                    std::panic::resume_unwind(payload)
                }
            }
        })
    }
}
