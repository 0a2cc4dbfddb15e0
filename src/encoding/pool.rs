//! Reusable byte-buffer arena for response serialization.
//!
//! Buffers are checked out with [`BufferPool::acquire`] and handed back
//! automatically when the returned [`PooledBuffer`] is dropped, so every exit
//! path (success, early return, `?`, panic unwind) releases the buffer.
//!
//! # Residency Bounds
//!
//! - A buffer whose capacity grew past `max_capacity` is discarded instead of
//!   pooled, so one rare oversized response cannot pin megabytes forever.
//! - At most `max_idle` buffers are kept; surplus buffers are dropped.
//!
//! # Concurrency
//!
//! The free list is the only shared state and sits behind a short
//! `parking_lot::Mutex` section. Ownership does the rest: the `Vec` lives
//! inside exactly one guard while checked out.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::metrics;

/// Default ceiling for buffers returned to the pool (1 MiB).
pub const DEFAULT_MAX_CAPACITY: usize = 1 << 20;

/// Default number of idle buffers kept around.
pub const DEFAULT_MAX_IDLE: usize = 256;

/// Capacity of freshly allocated buffers.
pub const DEFAULT_INITIAL_CAPACITY: usize = 512;

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Buffers with a larger capacity are never pooled.
    pub max_capacity: usize,
    /// Maximum number of idle buffers retained.
    pub max_idle: usize,
    /// Capacity of a freshly allocated buffer.
    pub initial_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAX_CAPACITY,
            max_idle: DEFAULT_MAX_IDLE,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
        }
    }
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Buffers currently idle in the pool.
    pub idle: usize,
    /// Buffers allocated because the pool was empty.
    pub allocated: u64,
    /// Acquisitions served from the pool.
    pub reused: u64,
    /// Buffers dropped on release for exceeding the capacity ceiling.
    pub discarded_oversize: u64,
}

struct PoolInner {
    config: BufferPoolConfig,
    free: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicU64,
    reused: AtomicU64,
    discarded_oversize: AtomicU64,
}

/// Thread-safe pool of byte buffers. Cloning shares the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with the given configuration.
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                free: Mutex::new(Vec::new()),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded_oversize: AtomicU64::new(0),
            }),
        }
    }

    /// Check out an empty buffer, recycled when possible.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = self.inner.free.lock().pop();

        let buf = match recycled {
            Some(buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.inner.config.initial_capacity)
            }
        };

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.free.lock().len(),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            discarded_oversize: self.inner.discarded_oversize.load(Ordering::Relaxed),
        }
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> BufferPoolConfig {
        self.inner.config
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

impl PoolInner {
    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.config.max_capacity {
            self.discarded_oversize.fetch_add(1, Ordering::Relaxed);
            metrics::record_buffer_discarded();
            trace!(
                capacity = buf.capacity(),
                ceiling = self.config.max_capacity,
                "Discarding oversized buffer"
            );
            return;
        }

        // Must be empty before anyone else can see it
        buf.clear();

        let mut free = self.free.lock();
        if free.len() < self.config.max_idle {
            free.push(buf);
        }
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Dereferences to `Vec<u8>`. Returned to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        // Only `None` during `drop`
        self.buf.as_ref().unwrap_or(&EMPTY)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.get_or_insert_with(Vec::new)
    }
}

static EMPTY: Vec<u8> = Vec::new();

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
