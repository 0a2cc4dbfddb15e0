//! Deadline guard: per-request time budget with cooperative cancellation.
//!
//! # How the budget is derived
//!
//! Each request gets a [`Deadline`] stored in its extensions. The guard derives
//! it from whatever the request already carries, taking the earliest of:
//!
//! 1. an inbound `Deadline` (set by an outer guard),
//! 2. this layer's budget,
//! 3. a client-specified `X-Request-Timeout` header (milliseconds).
//!
//! A client can therefore tighten its own budget but never extend the one the
//! server imposes. Hot-path routes wrap themselves with a second, tighter
//! `DeadlineLayer`; the two compose by intersection.
//!
//! # Cancellation
//!
//! When the deadline fires first the guard answers 504 and drops the inner
//! future, which stops at its next `.await`. Nothing is preempted: a handler
//! that blocks its thread keeps running until it yields. Handlers that want to
//! produce their own response on expiry race their work with
//! [`Deadline::run`]. The deadline's token is cancelled on every exit path.

use std::future::Future;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metrics;

/// Default budget of the generic deadline stage.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Default budget for hot-path endpoints.
pub const DEFAULT_HOT_PATH_TIMEOUT: Duration = Duration::from_millis(80);

/// Minimum accepted client timeout.
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1;

/// Maximum accepted client timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// Header name for client-specified request timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// The deadline expired before the guarded work completed.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("deadline of {budget:?} exceeded")]
pub struct DeadlineExceeded {
    pub budget: Duration,
}

impl From<DeadlineExceeded> for AppError {
    fn from(e: DeadlineExceeded) -> Self {
        AppError::DeadlineExceeded { budget: e.budget }
    }
}

/// Execution context for one request: an expiry instant plus a cancellation
/// signal. Cheap to clone; clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    budget: Duration,
    token: CancellationToken,
}

impl Deadline {
    /// A fresh deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
            budget,
            token: CancellationToken::new(),
        }
    }

    /// Derive a deadline bounded by both `self` and `budget` from now.
    ///
    /// Cancelling the parent cancels the child, not the other way round.
    pub fn child(&self, budget: Duration) -> Self {
        let candidate = Instant::now() + budget;
        let (expires_at, budget) = if candidate < self.expires_at {
            (candidate, budget)
        } else {
            (self.expires_at, self.budget)
        };

        Self {
            expires_at,
            budget,
            token: self.token.child_token(),
        }
    }

    /// Instant at which the deadline fires.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// The budget that determined `expires_at`.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || Instant::now() >= self.expires_at
    }

    /// Whether the expiry instant has passed, ignoring cancellation.
    ///
    /// The token is also cancelled when a request finishes or its caller goes
    /// away, so only the clock tells a timeout apart from an abort.
    pub fn has_elapsed(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Cancel this deadline (and every child) immediately.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves when the deadline fires or is cancelled.
    pub async fn expired(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.expires_at) => {}
            _ = self.token.cancelled() => {}
        }
    }

    /// Run `fut` unless the deadline fires first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        tokio::select! {
            biased;

            output = fut => Ok(output),
            _ = self.expired() => Err(DeadlineExceeded { budget: self.budget }),
        }
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<S> FromRequestParts<S> for Deadline
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Deadline>()
            .cloned()
            .ok_or_else(|| AppError::Internal("deadline guard is not installed".to_string()))
    }
}

/// Parse a client-specified timeout, ignoring values outside the allowed range.
fn client_timeout<B>(req: &Request<B>) -> Option<Duration> {
    let value = req.headers().get(REQUEST_TIMEOUT_HEADER)?;
    let parsed = value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok());

    match parsed {
        Some(ms) if (MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&ms) => {
            Some(Duration::from_millis(ms))
        }
        Some(ms) => {
            debug!(
                timeout_ms = ms,
                min = MIN_REQUEST_TIMEOUT_MS,
                max = MAX_REQUEST_TIMEOUT_MS,
                "Client timeout outside allowed range, ignoring"
            );
            None
        }
        None => {
            debug!(value = ?value, "Invalid X-Request-Timeout header value, ignoring");
            None
        }
    }
}

/// Deadline layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/echo", post(echo))
///     .route_layer(DeadlineLayer::new(Duration::from_millis(80)));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DeadlineLayer {
    budget: Duration,
}

impl DeadlineLayer {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            budget: self.budget,
        }
    }
}

/// Deadline service wrapper.
#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
    budget: Duration,
}

impl<S> Service<Request<Body>> for DeadlineService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut deadline = match req.extensions().get::<Deadline>() {
            Some(inbound) => inbound.child(self.budget),
            None => Deadline::after(self.budget),
        };
        if let Some(client_budget) = client_timeout(&req) {
            deadline = deadline.child(client_budget);
        }

        req.extensions_mut().insert(deadline.clone());
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Released on every exit path, including the inner future panicking
            let _release = deadline.token().clone().drop_guard();

            match deadline.run(inner.call(req)).await {
                Ok(result) => result,
                Err(exceeded) => {
                    warn!(budget_ms = exceeded.budget.as_millis(), "Request deadline exceeded");
                    metrics::record_deadline_exceeded();
                    Ok(AppError::from(exceeded).into_response())
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use tower::ServiceExt;

    #[tokio::test(start_paused = true)]
    async fn test_child_never_extends_parent() {
        let parent = Deadline::after(Duration::from_millis(100));
        let child = parent.child(Duration::from_secs(10));
        assert_eq!(child.expires_at(), parent.expires_at());

        let tighter = parent.child(Duration::from_millis(80));
        assert!(tighter.expires_at() < parent.expires_at());
        assert_eq!(tighter.budget(), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_reaches_child() {
        let parent = Deadline::after(Duration::from_secs(1));
        let child = parent.child(Duration::from_secs(1));

        parent.cancel();
        assert!(child.is_expired());

        let grandchild = Deadline::after(Duration::from_secs(1));
        let other = grandchild.child(Duration::from_secs(1));
        other.cancel();
        assert!(!grandchild.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let result = deadline
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await;

        assert_eq!(
            result,
            Err(DeadlineExceeded {
                budget: Duration::from_millis(100)
            })
        );
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_gets_504_within_budget() {
        let slow = tower::service_fn(|_req: Request<Body>| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });
        let svc = DeadlineLayer::new(Duration::from_millis(100)).layer(slow);

        let start = Instant::now();
        let response = svc
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_sees_deadline_in_extensions() {
        let inspect = tower::service_fn(|req: Request<Body>| async move {
            let deadline = req.extensions().get::<Deadline>().cloned().unwrap();
            assert!(deadline.remaining() <= Duration::from_millis(100));
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });
        let svc = DeadlineLayer::new(Duration::from_millis(100)).layer(inspect);

        let response = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_header_tightens_budget() {
        let inspect = tower::service_fn(|req: Request<Body>| async move {
            let deadline = req.extensions().get::<Deadline>().cloned().unwrap();
            assert_eq!(deadline.budget(), Duration::from_millis(20));
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });
        let svc = DeadlineLayer::new(Duration::from_millis(100)).layer(inspect);

        let req = Request::builder()
            .header(REQUEST_TIMEOUT_HEADER, "20")
            .body(Body::empty())
            .unwrap();
        assert_eq!(svc.oneshot(req).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_header_cannot_extend_budget() {
        let inspect = tower::service_fn(|req: Request<Body>| async move {
            let deadline = req.extensions().get::<Deadline>().cloned().unwrap();
            assert_eq!(deadline.budget(), Duration::from_millis(100));
            Ok::<_, Infallible>(Response::new(Body::empty()))
        });
        let svc = DeadlineLayer::new(Duration::from_millis(100)).layer(inspect);

        let req = Request::builder()
            .header(REQUEST_TIMEOUT_HEADER, "60000")
            .body(Body::empty())
            .unwrap();
        assert_eq!(svc.oneshot(req).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_released_after_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Arc::new(parking_lot::Mutex::new(Some(tx)));
        let capture = tower::service_fn(move |req: Request<Body>| {
            let tx = tx.clone();
            async move {
                let deadline = req.extensions().get::<Deadline>().cloned().unwrap();
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(deadline);
                }
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }
        });
        let svc = DeadlineLayer::new(Duration::from_secs(5)).layer(capture);

        svc.oneshot(Request::new(Body::empty())).await.unwrap();
        let deadline = rx.await.unwrap();
        assert!(deadline.is_expired(), "context must be released once the request ends");
    }

    #[test]
    fn test_client_timeout_bounds() {
        let req = |v: &str| {
            Request::builder()
                .header(REQUEST_TIMEOUT_HEADER, v)
                .body(())
                .unwrap()
        };

        assert_eq!(client_timeout(&req("250")), Some(Duration::from_millis(250)));
        assert_eq!(client_timeout(&req("0")), None);
        assert_eq!(client_timeout(&req("300001")), None);
        assert_eq!(client_timeout(&req("soon")), None);
        assert_eq!(client_timeout(&Request::new(())), None);
    }
}
