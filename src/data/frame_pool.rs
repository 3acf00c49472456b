//! Preallocated frame buffers.
//!
//! The camera task reads every frame into a buffer taken from a
//! [`FramePool`]. [`PooledFrame::freeze`] hands the buffer to `bytes::Bytes`
//! without copying; when the last `Bytes` clone drops (after dispatch and
//! saving) the buffer goes back to the pool.
//!
//! ```text
//! 1. FramePool allocates pool_size buffers of frame_bytes at startup
//! 2. try_acquire() pops one, or returns None when the pool is empty
//! 3. The camera copies pixels in and calls freeze()
//! 4. Frame -> dispatcher -> Volume -> saver, all sharing the same Bytes
//! 5. Last Bytes drop pushes the buffer back
//! ```
//!
//! An exhausted pool is the backpressure signal: the camera leaves pending
//! triggers unread until buffers come back.

use crate::error::{AppResult, DaqError};
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

struct FramePoolInner {
    free_buffers: SegQueue<Vec<u8>>,
    frame_bytes: usize,
    pool_size: usize,
    available: AtomicUsize,
}

impl FramePoolInner {
    fn give_back(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.free_buffers.push(buffer);
        self.available.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pool of frame-sized byte buffers.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<FramePoolInner>,
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("pool_size", &self.inner.pool_size)
            .field("frame_bytes", &self.inner.frame_bytes)
            .field("available", &self.available())
            .finish()
    }
}

impl FramePool {
    /// Allocate `pool_size` buffers of `frame_bytes` each.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Configuration`] if either argument is zero.
    pub fn new(pool_size: usize, frame_bytes: usize) -> AppResult<Self> {
        if pool_size == 0 || frame_bytes == 0 {
            return Err(DaqError::Configuration(format!(
                "Frame pool needs at least one buffer of at least one byte (got {} x {})",
                pool_size, frame_bytes
            )));
        }

        let free_buffers = SegQueue::new();
        for _ in 0..pool_size {
            free_buffers.push(Vec::with_capacity(frame_bytes));
        }

        info!(
            pool_size,
            frame_mb = frame_bytes as f64 / (1024.0 * 1024.0),
            total_mb = (pool_size * frame_bytes) as f64 / (1024.0 * 1024.0),
            "FramePool created"
        );

        Ok(Self {
            inner: Arc::new(FramePoolInner {
                free_buffers,
                frame_bytes,
                pool_size,
                available: AtomicUsize::new(pool_size),
            }),
        })
    }

    /// Take a buffer without waiting. `None` means the pool is exhausted.
    #[must_use]
    pub fn try_acquire(&self) -> Option<PooledFrame> {
        let buffer = self.inner.free_buffers.pop()?;
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        Some(PooledFrame {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Buffers currently in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }
}

/// A buffer on loan from a [`FramePool`].
pub struct PooledFrame {
    buffer: Option<Vec<u8>>,
    pool: Arc<FramePoolInner>,
}

impl PooledFrame {
    /// Fill with little-endian pixels produced by `pixel(i)`.
    pub fn fill_pixels(&mut self, n_pixels: usize, mut pixel: impl FnMut(usize) -> u16) {
        let n = n_pixels.min(self.pool.frame_bytes / 2);
        if let Some(buf) = self.buffer.as_mut() {
            buf.clear();
            for i in 0..n {
                buf.extend_from_slice(&pixel(i).to_le_bytes());
            }
        }
    }

    /// Valid bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into `Bytes` without copying.
    #[must_use]
    pub fn freeze(mut self) -> Bytes {
        match self.buffer.take() {
            Some(buffer) => Bytes::from_owner(PoolOwner {
                buffer,
                pool: Arc::clone(&self.pool),
            }),
            None => Bytes::new(),
        }
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer);
        }
    }
}

struct PoolOwner {
    buffer: Vec<u8>,
    pool: Arc<FramePoolInner>,
}

impl AsRef<[u8]> for PoolOwner {
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for PoolOwner {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_pool() {
        assert!(FramePool::new(0, 16).is_err());
        assert!(FramePool::new(4, 0).is_err());
    }

    #[test]
    fn exhausts_and_recovers() {
        let pool = FramePool::new(2, 16).unwrap();
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());

        drop(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn frozen_bytes_return_buffer_on_last_drop() {
        let pool = FramePool::new(1, 8).unwrap();
        let mut buf = pool.try_acquire().unwrap();
        buf.fill_pixels(4, |i| i as u16);
        assert_eq!(buf.len(), 8);

        let bytes = buf.freeze();
        let clone = bytes.clone();
        assert_eq!(&bytes[..4], &[0, 0, 1, 0]);
        assert_eq!(pool.available(), 0);

        drop(bytes);
        assert_eq!(pool.available(), 0);
        drop(clone);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn fill_truncates_to_capacity() {
        let pool = FramePool::new(1, 4).unwrap();
        let mut buf = pool.try_acquire().unwrap();
        assert!(buf.is_empty());
        buf.fill_pixels(8, |_| 7);
        assert_eq!(buf.len(), 4);
    }
}
