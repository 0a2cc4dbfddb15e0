use std::time::Duration;

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::encoding::{EncodeError, SchemaError};

/// Application-wide error types with appropriate HTTP status codes.
///
/// The gating stages of the pipeline each resolve their rejection into one of
/// these variants and stop there:
///
/// - `Overloaded` - token bucket empty (429, retry with backoff)
/// - `CircuitOpen` - failure containment is rejecting calls (503, retry after cooldown)
/// - `DeadlineExceeded` - the request budget ran out (504, may be retried)
/// - `Panic` / `Internal` - programming or runtime fault (500, never retried blindly)
/// - `Schema` - malformed or unexpected input (400, client must fix the payload)
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Admission denied, retry in {retry_after:?}")]
    Overloaded {
        /// Time until the bucket holds a token again.
        retry_after: Duration,
        /// Bucket capacity, reported as `X-RateLimit-Limit`.
        limit: u32,
    },

    #[error("Circuit open, {remaining:?} of cooldown left")]
    CircuitOpen { remaining: Duration },

    #[error("Deadline exceeded after {budget:?}")]
    DeadlineExceeded { budget: Duration },

    #[error("Handler panicked: {0}")]
    Panic(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl AppError {
    /// HTTP status the variant maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Schema(_) => StatusCode::BAD_REQUEST,
            AppError::Panic(_)
            | AppError::Internal(_)
            | AppError::Encode(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Overloaded { .. } => "too_many_requests",
            AppError::CircuitOpen { .. } => "service_unavailable",
            AppError::DeadlineExceeded { .. } => "timeout",
            AppError::Schema(_) => "bad_request",
            AppError::Panic(_) | AppError::Internal(_) => "internal_error",
            AppError::Encode(_) => "encode_error",
            AppError::ConfigError(_) => "config_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Full detail goes to the operator's logs only. Rejections from the
        // gating stages are expected under load and are logged where they happen.
        if status.is_server_error() && !matches!(self, AppError::CircuitOpen { .. }) {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let message = match &self {
            AppError::Overloaded { .. } => "Rate limit exceeded. Please retry later.".to_string(),
            AppError::CircuitOpen { .. } => {
                "Service temporarily unavailable. Please retry later.".to_string()
            }
            AppError::DeadlineExceeded { .. } => "Request timed out. Please try again.".to_string(),
            // Decode errors are client-caused; the sanitized message helps them
            // fix the payload without leaking internal type names.
            AppError::Schema(e) => e.client_message(),
            AppError::Panic(_) | AppError::Internal(_) | AppError::Encode(_) => {
                "internal server error".to_string()
            }
            AppError::ConfigError(_) => "Service configuration error.".to_string(),
        };

        let body = ErrorResponse {
            error: self.code(),
            message,
        };

        let mut response = (status, axum::Json(body)).into_response();

        match &self {
            AppError::Overloaded { retry_after, limit } => {
                let headers = response.headers_mut();
                headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
                headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            }
            AppError::CircuitOpen { remaining } => {
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(*remaining)));
            }
            _ => {}
        }

        response
    }
}

/// Whole seconds for `Retry-After`, rounded up and at least 1, so clients
/// never retry before a token exists or the cooldown has ended.
fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs()
        .saturating_add(u64::from(wait.subsec_nanos() > 0))
        .max(1)
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
