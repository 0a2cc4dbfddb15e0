//! Allocation-efficient response serialization.
//!
//! - [`pool`]: bounded arena of reusable byte buffers
//! - [`json`]: raw JSON encoding into pooled buffers, strict-schema decoding

pub mod json;
pub mod pool;

pub use json::{EncodeError, SchemaError, decode, encode, json_response};
pub use pool::{BufferPool, BufferPoolConfig, PoolStats, PooledBuffer};
