//! Bounded JSON encoding and strict-schema decoding.
//!
//! - [`encode`] appends raw JSON (no HTML escaping) plus a trailing newline to
//!   a caller-owned buffer, normally a [`PooledBuffer`].
//! - [`decode`] reads one value from a byte stream. Target types opt into
//!   strict schemas with `#[serde(deny_unknown_fields)]`; unknown fields,
//!   malformed input and trailing data are all rejected.
//! - [`json_response`] ties the two to the pool for handlers.

use std::io::{BufReader, Read};

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::pool::{BufferPool, PooledBuffer};
use crate::error::AppResult;

/// A value could not be represented as JSON.
#[derive(Debug, Error)]
#[error("failed to encode response: {0}")]
pub struct EncodeError(#[source] serde_json::Error);

/// A request payload was malformed or did not match the target schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("invalid payload: {0}")]
    Invalid(#[source] serde_json::Error),

    #[error("failed to read request body: {0}")]
    Io(#[source] serde_json::Error),
}

impl SchemaError {
    fn classify(e: serde_json::Error) -> Self {
        if e.is_io() {
            return SchemaError::Io(e);
        }

        let msg = e.to_string();
        if let Some(field) = backticked_after(&msg, "unknown field") {
            return SchemaError::UnknownField(field);
        }
        if let Some(field) = backticked_after(&msg, "missing field") {
            return SchemaError::MissingField(field);
        }
        SchemaError::Invalid(e)
    }

    /// Sanitized message safe to return to the client.
    ///
    /// Serde messages can mention internal type names, so only field names
    /// the client itself sent (or must send) are echoed back.
    pub fn client_message(&self) -> String {
        match self {
            SchemaError::UnknownField(field) => format!("Unknown field: {field}"),
            SchemaError::MissingField(field) => format!("Missing required field: {field}"),
            SchemaError::Invalid(e) if e.is_data() => "Invalid data type in request body".into(),
            SchemaError::Invalid(_) => "Malformed JSON in request body".into(),
            SchemaError::Io(_) => "Request body could not be read or exceeds the size limit".into(),
        }
    }
}

fn backticked_after(msg: &str, marker: &str) -> Option<String> {
    let rest = msg.get(msg.find(marker)? + marker.len()..)?;
    let start = rest.find('`')? + 1;
    let len = rest.get(start..)?.find('`')?;
    rest.get(start..start + len).map(str::to_string)
}

/// Append the JSON encoding of `value` and a newline to `buf`.
///
/// On failure `buf` is truncated back to its previous length, so a partial
/// encoding never reaches the client.
pub fn encode<T>(value: &T, buf: &mut Vec<u8>) -> Result<(), EncodeError>
where
    T: Serialize + ?Sized,
{
    let start = buf.len();
    match serde_json::to_writer(&mut *buf, value) {
        Ok(()) => {
            buf.push(b'\n');
            Ok(())
        }
        Err(e) => {
            buf.truncate(start);
            Err(EncodeError(e))
        }
    }
}

/// Decode one JSON value from `reader`.
///
/// The reader is consumed incrementally through a fixed-size buffer; the body
/// never has to be fully held in memory first. serde_json reads byte by byte,
/// so the buffer keeps the number of `read` calls on the source proportional
/// to the body size divided by the buffer size.
pub fn decode<T, R>(reader: R) -> Result<T, SchemaError>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut de = serde_json::Deserializer::from_reader(BufReader::new(reader));
    let value = T::deserialize(&mut de).map_err(SchemaError::classify)?;
    de.end().map_err(SchemaError::classify)?;
    Ok(value)
}

/// Build a JSON response using a buffer from `pool`.
///
/// The pooled buffer is released before this returns, on success and on
/// encode failure alike.
pub fn json_response<T>(pool: &BufferPool, status: StatusCode, value: &T) -> AppResult<Response>
where
    T: Serialize + ?Sized,
{
    let mut buf: PooledBuffer = pool.acquire();
    encode(value, &mut buf)?;

    let body = Bytes::copy_from_slice(&buf);
    drop(buf);

    let len = body.len();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));

    Ok(response)
}
