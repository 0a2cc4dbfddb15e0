//! Request ID propagation.
//!
//! - Reuses a client-supplied `X-Request-Id` when it is a sane header value
//! - Otherwise generates a UUIDv4
//! - Exposes the id to handlers as a [`RequestId`] extension
//! - Echoes it on the response
//! - Opens a `handler` span with a `request_id` field around the inner call
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8080/echo -d '{"message":"hi"}'
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id that is propagated as-is.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(HeaderValue);

impl RequestId {
    pub fn as_str(&self) -> &str {
        // Only ever built from visible ASCII
        self.0.to_str().unwrap_or_default()
    }

    fn header_value(&self) -> HeaderValue {
        self.0.clone()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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
        let request_id = extract_or_generate_request_id(&req);

        req.headers_mut()
            .insert(REQUEST_ID_HEADER, request_id.header_value());
        req.extensions_mut().insert(request_id.clone());

        debug!(request_id = %request_id, "Processing request");

        // Everything logged downstream carries the id
        let span = info_span!("handler", request_id = %request_id);
        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let mut response = inner.call(req).await?;
                response
                    .headers_mut()
                    .insert(REQUEST_ID_HEADER, request_id.header_value());
                Ok(response)
            }
            .instrument(span),
        )
    }
}

fn extract_or_generate_request_id<B>(req: &Request<B>) -> RequestId {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && is_acceptable(value)
    {
        return RequestId(value.clone());
    }

    let generated = Uuid::new_v4().to_string();
    match HeaderValue::from_str(&generated) {
        Ok(value) => RequestId(value),
        Err(_) => RequestId(HeaderValue::from_static("unknown")),
    }
}

fn is_acceptable(value: &HeaderValue) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_REQUEST_ID_LEN
        && bytes.iter().all(|b| b.is_ascii_graphic())
}
