//! Reusable read buffers for pooled connections (§3 "Pooled connection",
//! §9 "Pooled mutable records").
//!
//! Each [`PooledConn`] (see [`crate::pool`]) is attached a read buffer of
//! [`DEFAULT_BUFFER_CAPACITY`] bytes, acquired from a shared [`BufferPool`]
//! on dial and released back on every path a connection leaves the pool.
//! [`BufferPool`] lets that buffer be handed back and reused by the next
//! connection dialed in its place, instead of reallocating on every call —
//! the same acquire/reset/release discipline the grounding repo's
//! `ProcessPool` applies to process slots, just applied to `Vec<u8>`
//! capacity.

use tokio::sync::Mutex;

/// Default capacity for a pooled read or write buffer (≈32 KiB, per §3).
pub const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024;

/// A single reusable buffer. `reset` clears contents but retains the
/// allocated capacity so repeated acquire/release cycles do not
/// reallocate.
#[derive(Debug)]
pub struct PooledBuffer {
    bytes: Vec<u8>,
}

impl PooledBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn reset(&mut self) {
        self.bytes.clear();
    }
}

/// A bounded pool of [`PooledBuffer`]s, retained up to `max_retained`.
///
/// Buffers beyond the retention bound are simply dropped on release —
/// retention is an optimization, not a correctness requirement, so there is
/// no blocking path here.
pub struct BufferPool {
    capacity: usize,
    max_retained: usize,
    idle: Mutex<Vec<PooledBuffer>>,
}

impl BufferPool {
    pub fn new(max_retained: usize) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY, max_retained)
    }

    pub fn with_capacity(capacity: usize, max_retained: usize) -> Self {
        Self {
            capacity,
            max_retained,
            idle: Mutex::new(Vec::with_capacity(max_retained)),
        }
    }

    /// Acquire a buffer, reusing a retained one if available.
    pub async fn acquire(&self) -> PooledBuffer {
        let mut idle = self.idle.lock().await;
        idle.pop().unwrap_or_else(|| PooledBuffer::new(self.capacity))
    }

    /// Return a buffer for reuse. Dropped (not retained) once the idle set
    /// is at `max_retained`.
    pub async fn release(&self, mut buf: PooledBuffer) {
        buf.reset();
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_retained {
            idle.push(buf);
        }
    }

    pub async fn retained_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}
