//! Panic containment.
//!
//! [`RecoveryLayer`] is the outermost fault boundary of the pipeline. It
//! catches a panic raised either while building the inner future (`call`) or
//! while polling it, logs the payload at `error`, and answers with a generic
//! 500. Nothing about the panic reaches the client.
//!
//! Only unwinding panics can be caught, so the binary must not be built with
//! `panic = "abort"`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use futures::FutureExt;
use tower::{Layer, Service};
use tracing::error;

use crate::error::AppError;
use crate::metrics;

/// Recovery layer for Tower middleware stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryLayer;

impl RecoveryLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

/// Recovery service wrapper.
#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RecoveryService<S>
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
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let mut inner = self.inner.clone();

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
            Ok(future) => future,
            Err(payload) => {
                let response = recovered(&method, &path, payload.as_ref());
                return Box::pin(async move { Ok(response) });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Ok(recovered(&method, &path, payload.as_ref())),
            }
        })
    }
}

fn recovered(method: &axum::http::Method, path: &str, payload: &(dyn Any + Send)) -> Response<Body> {
    let message = panic_message(payload);
    error!(%method, path, panic = %message, "Recovered from panic in request handler");
    metrics::record_panic_recovered();

    AppError::Panic(message).into_response()
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
