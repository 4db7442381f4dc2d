//! Bounded pool of reusable response buffers.
//!
//! The pool is filled once at startup with one buffer per admission slot,
//! so under full load every in-flight connection owns exactly one buffer
//! and steady state performs no allocation. A [`BufferSlot`] goes back to
//! the pool when dropped, whatever path the request took.

use async_channel::{Receiver, Sender};

use super::{MetadataProxyError, Result};

/// Size of each pooled buffer.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// A fixed-capacity pool of byte buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    free: Receiver<Vec<u8>>,
    release: Sender<Vec<u8>>,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool holding `capacity` buffers of [`BUFFER_SIZE`] bytes.
    pub fn new(capacity: usize) -> Self {
        let (release, free) = async_channel::bounded(capacity.max(1));
        for _ in 0..capacity {
            // The channel has room for every buffer we create.
            let _ = release.try_send(vec![0u8; BUFFER_SIZE]);
        }

        Self {
            free,
            release,
            capacity,
        }
    }

    /// Take a buffer, waiting until one is free.
    pub async fn acquire(&self) -> Result<BufferSlot> {
        let buf = self
            .free
            .recv()
            .await
            .map_err(|_| MetadataProxyError::Internal("buffer pool closed".to_string()))?;

        Ok(BufferSlot {
            buf: Some(buf),
            release: self.release.clone(),
        })
    }

    /// Take a buffer if one is free right now.
    pub fn try_acquire(&self) -> Option<BufferSlot> {
        self.free.try_recv().ok().map(|buf| BufferSlot {
            buf: Some(buf),
            release: self.release.clone(),
        })
    }

    /// Total number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// A borrowed buffer. Returned to its pool on drop.
#[derive(Debug)]
pub struct BufferSlot {
    buf: Option<Vec<u8>>,
    release: Sender<Vec<u8>>,
}

impl BufferSlot {
    /// The buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }

    /// The buffer contents, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the buffer has no capacity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BufferSlot {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            // Never blocks: the channel holds every buffer the pool made.
            let _ = self.release.try_send(buf);
        }
    }
}
