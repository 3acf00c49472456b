//! Sample rings between waveform generation and hardware transfer.
//!
//! The scan loop generates one full scan period at a time while the analog
//! board consumes fixed-size chunks. [`RollingBuffer`] decouples the two:
//! the producer writes whole periods, the consumer reads whatever chunk
//! size the board wants, and neither side ever sees data overwritten.
//!
//! [`FillingRollingBuffer`] is a positional ring used to record one period
//! of position feedback. It tracks which slots have been written so readers
//! can tell when a full period is available.
//!
//! # Example
//! ```
//! use lightsheet_daq::data::rolling_buffer::RollingBuffer;
//!
//! let mut buffer = RollingBuffer::<f64>::new(8);
//! buffer.write(&[1.0, 2.0, 3.0]).unwrap();
//! assert_eq!(buffer.read(2).unwrap(), vec![1.0, 2.0]);
//! assert_eq!(buffer.available(), 1);
//! ```

use crate::error::{AppResult, DaqError};

/// Bounded FIFO ring that refuses to overwrite unread samples.
#[derive(Debug, Clone)]
pub struct RollingBuffer<T> {
    data: Vec<T>,
    /// Index of the oldest unread sample
    head: usize,
    /// Number of unread samples
    len: usize,
}

impl<T: Copy + Default> RollingBuffer<T> {
    /// Create an empty buffer holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![T::default(); capacity],
            head: 0,
            len: 0,
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unread samples.
    pub fn available(&self) -> usize {
        self.len
    }

    /// Slots that can be written without overrunning.
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Append `samples` behind the unread data.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Overrun`] if `samples` does not fit in the free
    /// space. Nothing is written in that case.
    pub fn write(&mut self, samples: &[T]) -> AppResult<()> {
        if samples.len() > self.free() {
            return Err(DaqError::Overrun {
                requested: samples.len(),
                free: self.free(),
            });
        }
        if samples.is_empty() {
            return Ok(());
        }

        let cap = self.capacity();
        let tail = (self.head + self.len) % cap;
        let first = samples.len().min(cap - tail);
        self.data[tail..tail + first].copy_from_slice(&samples[..first]);
        let rest = samples.len() - first;
        self.data[..rest].copy_from_slice(&samples[first..]);
        self.len += samples.len();
        Ok(())
    }

    /// Remove and return exactly `n` samples in write order.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Underrun`] if fewer than `n` samples are held.
    pub fn read(&mut self, n: usize) -> AppResult<Vec<T>> {
        if n > self.len {
            return Err(DaqError::Underrun {
                requested: n,
                available: self.len,
            });
        }
        let mut out = Vec::with_capacity(n);
        if n == 0 {
            return Ok(out);
        }

        let cap = self.capacity();
        let first = n.min(cap - self.head);
        out.extend_from_slice(&self.data[self.head..self.head + first]);
        out.extend_from_slice(&self.data[..n - first]);
        self.head = (self.head + n) % cap;
        self.len -= n;
        Ok(out)
    }

    /// Drop every unread sample.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

/// Positional ring with a fill mask.
///
/// Writes land at an absolute sample position modulo the ring length. The
/// ring is complete once every slot has been written at least once since
/// the last [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct FillingRollingBuffer<T> {
    data: Vec<T>,
    filled: Vec<bool>,
    n_filled: usize,
}

impl<T: Copy + Default> FillingRollingBuffer<T> {
    /// Create an empty ring of `len` slots.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![T::default(); len],
            filled: vec![false; len],
            n_filled: 0,
        }
    }

    /// Ring length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the ring has zero slots.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write `samples` starting at position `start` (taken modulo the length).
    ///
    /// Samples beyond one full ring length are ignored; the ring only ever
    /// holds the most recent period.
    pub fn write_at(&mut self, start: u64, samples: &[T]) {
        let len = self.len();
        if len == 0 {
            return;
        }
        let offset = (start % len as u64) as usize;
        for (k, sample) in samples.iter().take(len).enumerate() {
            let i = (offset + k) % len;
            self.data[i] = *sample;
            if !self.filled[i] {
                self.filled[i] = true;
                self.n_filled += 1;
            }
        }
    }

    /// Read `n` samples starting at position `start`, wrapping as needed.
    pub fn read_at(&self, start: u64, n: usize) -> Vec<T> {
        let len = self.len();
        if len == 0 {
            return Vec::new();
        }
        let offset = (start % len as u64) as usize;
        (0..n).map(|k| self.data[(offset + k) % len]).collect()
    }

    /// True once every slot has been written.
    pub fn is_complete(&self) -> bool {
        !self.data.is_empty() && self.n_filled == self.data.len()
    }

    /// Forget every write.
    pub fn reset(&mut self) {
        self.filled.iter_mut().for_each(|f| *f = false);
        self.n_filled = 0;
    }

    /// The whole ring in position order.
    pub fn snapshot(&self) -> Vec<T> {
        self.data.clone()
    }
}
