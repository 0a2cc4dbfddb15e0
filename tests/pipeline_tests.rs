//! End-to-end tests of the composed pipeline in front of an axum router.
//!
//! Time-dependent tests run on tokio's paused clock, so budgets and cooldowns
//! are exact and the suite never sleeps for real.
//!
//! Run with: `cargo test --test pipeline_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::SERVER;
use axum::http::{Request, Response, StatusCode};
use axum::routing::get;
use highperf_api::middleware::{
    CircuitBreakerConfig, CircuitState, RateLimitConfig, REQUEST_ID_HEADER, REQUEST_TIMEOUT_HEADER,
};
use highperf_api::{Deadline, Pipeline, PipelineConfig};
use tokio::time::Instant;
use tower::ServiceExt;

/// Downstream handler whose next N calls fail with 500.
#[derive(Clone, Default)]
struct Downstream {
    calls: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl Downstream {
    fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn work(State(downstream): State<Downstream>) -> StatusCode {
    downstream.calls.fetch_add(1, Ordering::SeqCst);
    let failed = downstream
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();

    if failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn slow(State(downstream): State<Downstream>) -> StatusCode {
    downstream.calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    StatusCode::OK
}

async fn boom() -> StatusCode {
    panic!("handler exploded");
}

async fn remaining(deadline: Deadline) -> String {
    deadline.remaining().as_millis().to_string()
}

fn pipeline(capacity: u32, refill: u32, threshold: u32, cooldown: Duration) -> Pipeline {
    Pipeline::new(PipelineConfig {
        rate_limit: RateLimitConfig {
            capacity,
            refill,
            period: Duration::from_secs(1),
        },
        circuit_breaker: CircuitBreakerConfig::new(threshold, cooldown, 2),
        ..PipelineConfig::default()
    })
    .unwrap()
}

fn app(pipeline: &Pipeline, downstream: Downstream) -> Router {
    Router::new()
        .route("/work", get(work))
        .route("/slow", get(slow))
        .route("/boom", get(boom))
        .route("/remaining", get(remaining))
        .layer(pipeline.clone())
        .with_state(downstream)
}

async fn send(app: &Router, path: &str) -> Response<Body> {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    app.clone().oneshot(req).await.unwrap()
}

async fn body_text(resp: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ============================================================================
// End-to-end scenario
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_end_to_end_scenario() {
    let downstream = Downstream::default();
    let pipeline = pipeline(5, 5, 3, Duration::from_secs(2));
    let app = app(&pipeline, downstream.clone());

    // Five immediate requests drain the bucket
    for _ in 0..5 {
        assert_eq!(send(&app, "/work").await.status(), StatusCode::OK);
    }

    // Sixth is rejected before reaching downstream
    assert_eq!(send(&app, "/work").await.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(downstream.calls(), 5);

    // Refill, then three downstream failures trip the breaker
    tokio::time::advance(Duration::from_secs(1)).await;
    downstream.fail_next(3);
    for _ in 0..3 {
        assert_eq!(
            send(&app, "/work").await.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
    assert_eq!(pipeline.breaker().state(), CircuitState::Open);

    // Within the cooldown: rejected without reaching downstream
    let resp = send(&app, "/work").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(downstream.calls(), 8);

    // After the cooldown: downstream is reached again
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(send(&app, "/work").await.status(), StatusCode::OK);
    assert_eq!(downstream.calls(), 9);

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.circuit_state, CircuitState::Closed);
    assert_eq!(snapshot.circuit_times_opened, 1);
    assert_eq!(snapshot.circuit_requests_rejected, 1);
    assert_eq!(snapshot.requests_rate_limited, 1);
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_exactly_capacity_requests_admitted_at_zero_elapsed() {
    let downstream = Downstream::default();
    let pipeline = pipeline(7, 1, 100, Duration::from_secs(2));
    let app = app(&pipeline, downstream.clone());

    let mut statuses = Vec::new();
    for _ in 0..8 {
        statuses.push(send(&app, "/work").await.status());
    }

    assert!(statuses[..7].iter().all(|s| *s == StatusCode::OK));
    assert_eq!(statuses[7], StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test(start_paused = true)]
async fn test_refill_admits_after_one_token_interval() {
    let downstream = Downstream::default();
    let pipeline = pipeline(2, 4, 100, Duration::from_secs(2));
    let app = app(&pipeline, downstream);

    send(&app, "/work").await;
    send(&app, "/work").await;
    assert_eq!(send(&app, "/work").await.status(), StatusCode::TOO_MANY_REQUESTS);

    // period / refill = 250ms
    tokio::time::advance(Duration::from_millis(250)).await;
    assert_eq!(send(&app, "/work").await.status(), StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_response_shape() {
    let pipeline = pipeline(1, 1, 100, Duration::from_secs(2));
    let app = app(&pipeline, Downstream::default());

    let ok = send(&app, "/work").await;
    assert!(ok.headers().contains_key(REQUEST_ID_HEADER));

    let resp = send(&app, "/work").await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()[SERVER], "highperf-api");
    assert_eq!(resp.headers()["retry-after"], "1");
    assert_eq!(resp.headers()["x-ratelimit-limit"], "1");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
    // Rejected before the observability hooks
    assert!(!resp.headers().contains_key(REQUEST_ID_HEADER));

    let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(body["error"], "too_many_requests");
}

// ============================================================================
// Failure containment
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_success_decays_failure_score() {
    let downstream = Downstream::default();
    let pipeline = pipeline(100, 100, 5, Duration::from_secs(2));
    let app = app(&pipeline, downstream.clone());

    downstream.fail_next(3);
    for _ in 0..3 {
        send(&app, "/work").await;
    }
    assert_eq!(pipeline.breaker().failure_score(), 3);

    send(&app, "/work").await;
    assert_eq!(pipeline.breaker().failure_score(), 1);
    send(&app, "/work").await;
    assert_eq!(pipeline.breaker().failure_score(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_count_as_breaker_failures() {
    let downstream = Downstream::default();
    let pipeline = pipeline(100, 100, 2, Duration::from_secs(2));
    let app = app(&pipeline, downstream.clone());

    for _ in 0..2 {
        assert_eq!(send(&app, "/slow").await.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    assert_eq!(send(&app, "/work").await.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(downstream.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_client_aborts_do_not_open_breaker() {
    let downstream = Downstream::default();
    let pipeline = pipeline(100, 100, 3, Duration::from_secs(2));
    let app = app(&pipeline, downstream.clone());

    // Callers give up long before the 100ms deadline
    for _ in 0..3 {
        let aborted = tokio::time::timeout(Duration::from_millis(10), send(&app, "/slow")).await;
        assert!(aborted.is_err());
    }
    assert_eq!(downstream.calls(), 3);

    assert_eq!(send(&app, "/work").await.status(), StatusCode::OK);
    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.circuit_state, CircuitState::Closed);
    assert_eq!(snapshot.circuit_times_opened, 0);
    assert_eq!(snapshot.failure_score, 0);
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out_within_budget() {
    let pipeline = pipeline(100, 100, 100, Duration::from_secs(2));
    let app = app(&pipeline, Downstream::default());

    let start = Instant::now();
    let resp = send(&app, "/slow").await;
    let elapsed = start.elapsed();

    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(resp.headers()[SERVER], "highperf-api");
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(110), "took {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_client_timeout_header_tightens_deadline() {
    let pipeline = pipeline(100, 100, 100, Duration::from_secs(2));
    let app = app(&pipeline, Downstream::default());

    let req = Request::builder()
        .uri("/remaining")
        .header(REQUEST_TIMEOUT_HEADER, "30")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(body_text(resp).await, "30");

    let req = Request::builder()
        .uri("/remaining")
        .header(REQUEST_TIMEOUT_HEADER, "5000")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(body_text(resp).await, "100");
}

// ============================================================================
// Panic containment
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_panic_becomes_generic_500() {
    let pipeline = pipeline(100, 100, 100, Duration::from_secs(2));
    let app = app(&pipeline, Downstream::default());

    let resp = send(&app, "/boom").await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers()[SERVER], "highperf-api");

    let body = body_text(resp).await;
    assert!(body.contains("internal server error"));
    assert!(!body.contains("exploded"));

    // The process and the pipeline keep serving
    assert_eq!(send(&app, "/work").await.status(), StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn test_panics_count_as_breaker_failures() {
    let pipeline = pipeline(100, 100, 2, Duration::from_secs(2));
    let app = app(&pipeline, Downstream::default());

    send(&app, "/boom").await;
    send(&app, "/boom").await;
    assert_eq!(send(&app, "/work").await.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Isolation and concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_independent_pipelines_are_isolated() {
    let first = pipeline(1, 1, 100, Duration::from_secs(2));
    let second = pipeline(1, 1, 100, Duration::from_secs(2));
    let app_a = app(&first, Downstream::default());
    let app_b = app(&second, Downstream::default());

    send(&app_a, "/work").await;
    assert_eq!(send(&app_a, "/work").await.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(send(&app_b, "/work").await.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_admission_never_overdraws() {
    let downstream = Downstream::default();
    // Refill so slow it never matters during the test
    let pipeline = Pipeline::new(PipelineConfig {
        rate_limit: RateLimitConfig {
            capacity: 500,
            refill: 1,
            period: Duration::from_secs(3600),
        },
        circuit_breaker: CircuitBreakerConfig::new(1000, Duration::from_secs(2), 2),
        request_timeout: Duration::from_secs(30),
        ..PipelineConfig::default()
    })
    .unwrap();
    let app = app(&pipeline, downstream.clone());

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move {
                let (mut ok, mut limited) = (0usize, 0usize);
                for _ in 0..50 {
                    match send(&app, "/work").await.status() {
                        StatusCode::OK => ok += 1,
                        StatusCode::TOO_MANY_REQUESTS => limited += 1,
                        other => panic!("unexpected status {other}"),
                    }
                }
                (ok, limited)
            })
        })
        .collect();

    let (mut ok, mut limited) = (0, 0);
    for handle in handles {
        let (o, l) = handle.await.unwrap();
        ok += o;
        limited += l;
    }

    assert_eq!(ok, 500);
    assert_eq!(limited, 64 * 50 - 500);
    assert_eq!(downstream.calls(), 500);

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.tokens_available, 0);
    assert_eq!(snapshot.requests_admitted, 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_failures_trip_breaker_once_per_threshold() {
    let downstream = Downstream::default();
    downstream.fail_next(usize::MAX);
    let pipeline = Pipeline::new(PipelineConfig {
        rate_limit: RateLimitConfig {
            capacity: 10_000,
            refill: 1,
            period: Duration::from_secs(3600),
        },
        circuit_breaker: CircuitBreakerConfig::new(10, Duration::from_secs(3600), 2),
        request_timeout: Duration::from_secs(30),
        ..PipelineConfig::default()
    })
    .unwrap();
    let app = app(&pipeline, downstream.clone());

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    let status = send(&app, "/work").await.status();
                    assert!(
                        status == StatusCode::INTERNAL_SERVER_ERROR
                            || status == StatusCode::SERVICE_UNAVAILABLE
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.circuit_state, CircuitState::Open);
    assert!(snapshot.circuit_times_opened >= 1);
    // Only calls already past the gate when it opened can still reach downstream
    assert!(downstream.calls() < 10 * snapshot.circuit_times_opened as usize + 32);
    assert_eq!(
        downstream.calls() as u64 + snapshot.circuit_requests_rejected,
        32 * 20
    );
}
