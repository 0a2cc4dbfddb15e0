//! Shared application state for Axum handlers.
//!
//! - **Pipeline**: the request-governance stages and their shared state
//! - **Buffer pool**: reusable response buffers
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken` for proper lifecycle management. Call `shutdown()`
//! to gracefully stop all background tasks before application exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRef;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::encoding::BufferPool;
use crate::error::AppResult;
use crate::extract::BodyLimit;
use crate::metrics;
use crate::pipeline::Pipeline;

/// Shared application state for Axum handlers.
///
/// Cloned for each request; everything inside is behind an `Arc`.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// state.spawn_metrics_publisher();
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Request-governance pipeline (shared bucket and breaker)
    pub pipeline: Pipeline,
    /// Response buffer pool
    pub pool: BufferPool,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create application state from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the pipeline settings are invalid.
    pub fn new(config: Config) -> AppResult<Self> {
        let pipeline = Pipeline::new(config.pipeline())?;
        let pool = BufferPool::new(config.buffer_pool());

        Ok(Self {
            config: Arc::new(config),
            pipeline,
            pool,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Spawn the background task that publishes pipeline and pool gauges.
    ///
    /// The task is tracked by `task_tracker` and respects `cancellation_token`
    /// for graceful shutdown.
    pub fn spawn_metrics_publisher(&self) {
        let pipeline = self.pipeline.clone();
        let pool = self.pool.clone();
        let period = self.config.metrics_publish_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Metrics publisher received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        publish_gauges(&pipeline, &pool);
                    }
                }
            }

            debug!("Metrics publisher shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl FromRef<AppState> for BodyLimit {
    fn from_ref(state: &AppState) -> Self {
        BodyLimit(state.config.max_request_body_size)
    }
}

fn publish_gauges(pipeline: &Pipeline, pool: &BufferPool) {
    let snapshot = pipeline.snapshot();
    metrics::set_tokens_available(snapshot.tokens_available);
    metrics::set_circuit_state(snapshot.circuit_state);
    metrics::set_buffer_pool_idle(pool.stats().idle);
}
