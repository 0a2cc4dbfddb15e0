//! # highperf-api
//!
//! A request-governance pipeline for Axum services, plus a small demo server
//! that runs it:
//!
//! - **Deadlines**: per-request time budget with cooperative cancellation (504)
//! - **Admission control**: token bucket with lazy refill (429)
//! - **Failure containment**: circuit breaker with decaying failure score (503)
//! - **Panic containment**: panics become a generic 500
//! - **Pooled encoding**: JSON responses built in reusable buffers, strict
//!   request decoding
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline (Server → Recover → Deadline → RateLimit →        │
//! │            CircuitBreaker → Metrics → RequestId)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (healthz, stats, echo)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Encoding (BufferPool, encode/decode, StrictJson)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use highperf_api::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Using the pipeline on your own router
//!
//! ```rust,no_run
//! use axum::{Router, routing::get};
//! use highperf_api::{Pipeline, PipelineConfig};
//!
//! # fn main() -> Result<(), highperf_api::AppError> {
//! let pipeline = Pipeline::new(PipelineConfig::default())?;
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(pipeline);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod encoding;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use encoding::{BufferPool, BufferPoolConfig};
pub use error::{AppError, AppResult};
pub use extract::{BodyLimit, StrictJson};
pub use middleware::Deadline;
pub use pipeline::{Pipeline, PipelineConfig, PipelineSnapshot};
pub use routes::build_router;
pub use state::AppState;
