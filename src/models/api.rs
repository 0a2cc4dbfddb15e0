use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoding::PoolStats;
use crate::pipeline::PipelineSnapshot;

/// Longest `delay_ms` the echo endpoint accepts. Any deadline fires well
/// before this; the cap only bounds timer resolution work.
pub const MAX_ECHO_DELAY_MS: u64 = 60_000;

/// Body of `POST /echo`.
///
/// Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EchoRequest {
    /// Text echoed back verbatim
    pub message: String,
    /// Simulated handler latency in milliseconds
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// Response of `POST /echo`.
#[derive(Debug, Serialize)]
pub struct EchoResponse {
    /// The message that was sent
    pub message: String,
    /// Correlation id of the request
    pub request_id: Option<String>,
    /// Budget left when the response was built
    pub deadline_remaining_ms: u64,
    /// Time the response was built
    pub timestamp: DateTime<Utc>,
}

/// Response of `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Token bucket and circuit breaker state
    pub pipeline: PipelineSnapshot,
    /// Response buffer pool counters
    pub buffer_pool: PoolStats,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::encoding::{SchemaError, decode};

    #[test]
    fn test_echo_request_minimal() {
        let request: EchoRequest = decode(r#"{"message": "hi"}"#.as_bytes()).unwrap();
        assert_eq!(request.message, "hi");
        assert_eq!(request.delay_ms, None);
    }

    #[test]
    fn test_echo_request_with_delay() {
        let request: EchoRequest =
            decode(r#"{"message": "hi", "delay_ms": 25}"#.as_bytes()).unwrap();
        assert_eq!(request.delay_ms, Some(25));
    }

    #[test]
    fn test_echo_request_rejects_unknown_field() {
        let err = decode::<EchoRequest, _>(r#"{"message": "hi", "admin": true}"#.as_bytes())
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField(f) if f == "admin"));
    }

    #[test]
    fn test_echo_response_serialization() {
        let response = EchoResponse {
            message: "<b>hi</b>".to_string(),
            request_id: Some("abc".to_string()),
            deadline_remaining_ms: 42,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert!(json.contains("\"request_id\":\"abc\""));
        assert!(json.contains("\"deadline_remaining_ms\":42"));
    }
}
