//! Admission control using a token bucket with lazy refill.
//!
//! # Algorithm
//!
//! The bucket holds at most `capacity` tokens. It is not refilled by a timer;
//! instead every admission attempt first credits the tokens earned since the
//! last refill:
//!
//! ```text
//! tokens_to_add = floor(refill * elapsed_nanos / period_nanos)
//! ```
//!
//! `last_refill` only moves when at least one token is credited, so short
//! intervals accumulate instead of being rounded away. A request that finds
//! the bucket empty is rejected without consuming anything and never reaches
//! the downstream handler.
//!
//! The refill and the take happen in one short critical section. Waiters are
//! not queued, so there is no FIFO fairness between concurrent callers.
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the next token is credited
//! - `X-RateLimit-Limit`: Bucket capacity
//! - `X-RateLimit-Remaining`: Always `0`

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use parking_lot::Mutex;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{trace, warn};

use crate::error::AppError;
use crate::metrics;

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum number of tokens the bucket can hold (burst size).
    pub capacity: u32,
    /// Tokens credited per `period`.
    pub refill: u32,
    /// Refill window.
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            refill: 1000,
            period: Duration::from_secs(1),
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was taken; `remaining` are left in the bucket.
    Admitted { remaining: u32 },
    /// The bucket is empty. The next token is due in `retry_after`.
    Rejected { retry_after: Duration },
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Thread-safe token bucket.
///
/// Starts full. Shared between all requests of one pipeline.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to take one token now.
    pub fn try_acquire(&self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    /// Try to take one token as of `now`.
    ///
    /// `now` earlier than the last refill is treated as no time elapsed.
    pub fn try_acquire_at(&self, now: Instant) -> Admission {
        let outcome = {
            let mut state = self.state.lock();
            self.refill(&mut state, now);

            if state.tokens == 0 {
                let since_refill = now.saturating_duration_since(state.last_refill);
                Admission::Rejected {
                    retry_after: self.token_interval().saturating_sub(since_refill),
                }
            } else {
                state.tokens -= 1;
                Admission::Admitted {
                    remaining: state.tokens,
                }
            }
        };

        match outcome {
            Admission::Admitted { .. } => self.admitted.fetch_add(1, Ordering::Relaxed),
            Admission::Rejected { .. } => self.rejected.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    /// Tokens currently available, after crediting elapsed time.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Total requests admitted since creation.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Total requests rejected since creation.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let period_nanos = self.config.period.as_nanos();
        if period_nanos == 0 {
            return;
        }

        let elapsed = now.saturating_duration_since(state.last_refill).as_nanos();
        let to_add = u128::from(self.config.refill).saturating_mul(elapsed) / period_nanos;
        if to_add > 0 {
            let to_add = u32::try_from(to_add).unwrap_or(u32::MAX);
            state.tokens = state.tokens.saturating_add(to_add).min(self.config.capacity);
            state.last_refill = now;
        }
    }

    /// Time it takes to earn one token.
    fn token_interval(&self) -> Duration {
        match self.config.refill {
            0 => self.config.period,
            refill => self.config.period / refill,
        }
    }
}

/// Rate limiting layer for Tower middleware stack.
///
/// Every service produced by one layer shares the same bucket.
///
/// # Example
///
/// ```rust,ignore
/// let bucket = Arc::new(TokenBucket::new(RateLimitConfig::default()));
/// let app = Router::new()
///     .route("/api", get(handler))
///     .layer(RateLimitLayer::new(bucket));
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    bucket: Arc<TokenBucket>,
}

impl RateLimitLayer {
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: self.bucket.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let admission = self.bucket.try_acquire();
        let limit = self.bucket.config().capacity;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match admission {
                Admission::Admitted { remaining } => {
                    trace!(remaining, "Request admitted");
                    inner.call(req).await
                }
                Admission::Rejected { retry_after } => {
                    warn!(
                        method = %req.method(),
                        path = %req.uri().path(),
                        retry_after_ms = retry_after.as_millis(),
                        "Rate limit exceeded"
                    );
                    metrics::record_rate_limited();

                    Ok(AppError::Overloaded { retry_after, limit }.into_response())
                }
            }
        })
    }
}
