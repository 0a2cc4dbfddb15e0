//! Streaming strict-JSON extractor.
//!
//! [`StrictJson`] replaces `axum::Json` for request bodies. The body is read
//! as a byte stream and fed to [`decode`](crate::encoding::decode) on a
//! blocking thread, so large payloads are parsed incrementally instead of
//! being collected first. Unknown fields are rejected by the target type's
//! `#[serde(deny_unknown_fields)]`.

use axum::body::Body;
use axum::extract::{FromRef, FromRequest, Request};
use futures::TryStreamExt;
use http_body_util::Limited;
use serde::de::DeserializeOwned;
use tokio_util::io::{StreamReader, SyncIoBridge};

use crate::encoding::decode;
use crate::error::AppError;

/// Maximum request body size accepted by [`StrictJson`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyLimit(pub usize);

/// JSON request body decoded with a strict schema.
#[derive(Debug, Clone)]
pub struct StrictJson<T>(pub T);

impl<T, S> FromRequest<S> for StrictJson<T>
where
    T: DeserializeOwned + Send + 'static,
    S: Send + Sync,
    BodyLimit: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let BodyLimit(limit) = BodyLimit::from_ref(state);

        let body = Body::new(Limited::new(req.into_body(), limit));
        let stream = body.into_data_stream().map_err(std::io::Error::other);
        // `decode` buffers its reader, so the bridge blocks once per chunk, not per byte
        let reader = SyncIoBridge::new(StreamReader::new(stream));

        let value = tokio::task::spawn_blocking(move || decode::<T, _>(reader))
            .await
            .map_err(|e| AppError::Internal(format!("decode task failed: {e}")))??;

        Ok(StrictJson(value))
    }
}
