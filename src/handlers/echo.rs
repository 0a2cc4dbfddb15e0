//! Hot-path echo endpoint.
//!
//! `POST /echo` runs under the tighter hot-path deadline. The body is decoded
//! strictly and the response is built with a pooled buffer. An optional
//! `delay_ms` simulates downstream latency and is raced against the deadline,
//! which makes the endpoint useful for exercising 504s and breaker trips.

use std::time::Duration;

use axum::Extension;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::encoding::json_response;
use crate::error::AppResult;
use crate::extract::StrictJson;
use crate::middleware::{Deadline, RequestId};
use crate::models::{EchoRequest, EchoResponse, MAX_ECHO_DELAY_MS};
use crate::state::AppState;

/// Echo the request message back.
///
/// # Errors
///
/// - 400 when the body is malformed or carries unknown fields
/// - 504 when `delay_ms` outlasts the request deadline
#[instrument(skip_all, fields(message_len = request.message.len()))]
pub async fn echo(
    State(state): State<AppState>,
    deadline: Deadline,
    request_id: Option<Extension<RequestId>>,
    StrictJson(request): StrictJson<EchoRequest>,
) -> AppResult<Response> {
    if let Some(delay_ms) = request.delay_ms {
        let delay = Duration::from_millis(delay_ms.min(MAX_ECHO_DELAY_MS));
        debug!(delay_ms = delay.as_millis(), "Simulating downstream latency");
        deadline.run(tokio::time::sleep(delay)).await?;
    }

    let body = EchoResponse {
        message: request.message,
        request_id: request_id.map(|Extension(id)| id.to_string()),
        deadline_remaining_ms: u64::try_from(deadline.remaining().as_millis()).unwrap_or(u64::MAX),
        timestamp: Utc::now(),
    };

    json_response(&state.pool, StatusCode::OK, &body)
}
