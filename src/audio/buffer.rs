//! Lock-free FIFOs for audio bytes and timestamp records
//!
//! This implements a single-producer single-consumer (SPSC) queue on top of
//! `crossbeam::queue::ArrayQueue`. The same type carries raw PCM bytes
//! (`ByteFifo`) and fixed-size timestamp records (`TimestampFifo`).

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::BufferError;
use crate::sync::timestamp::TimestampRecord;

/// Bounded FIFO of `Copy` elements
///
/// Writes that do not fit are truncated (the return value says how much
/// went in) unless the FIFO was created with `reader_throttles_writer`, in
/// which case the writer waits for the reader to make room. Reads never
/// block and may return 0.
pub struct Fifo<T: Copy> {
    queue: ArrayQueue<T>,
    reader_throttles_writer: bool,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

/// FIFO of raw interleaved PCM bytes
pub type ByteFifo = Fifo<u8>;

/// FIFO of per-write timestamp records
pub type TimestampFifo = Fifo<TimestampRecord>;

impl<T: Copy> Fifo<T> {
    /// Create a FIFO holding up to `capacity` elements
    pub fn new(capacity: usize, reader_throttles_writer: bool) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity(capacity));
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
            reader_throttles_writer,
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        })
    }

    /// Append `data`, returning how many elements were actually written
    pub fn write(&self, data: &[T]) -> usize {
        let backoff = Backoff::new();
        let mut written = 0;

        while written < data.len() {
            match self.queue.push(data[written]) {
                Ok(()) => {
                    written += 1;
                    backoff.reset();
                }
                Err(_) if self.reader_throttles_writer => backoff.snooze(),
                Err(_) => break,
            }
        }

        if written < data.len() {
            self.overflow_count
                .fetch_add(data.len() - written, Ordering::Relaxed);
        }
        written
    }

    /// Append `data`, failing if it did not fit entirely
    pub fn write_all(&self, data: &[T]) -> Result<(), BufferError> {
        let written = self.write(data);
        if written != data.len() {
            return Err(BufferError::ShortWrite {
                written,
                requested: data.len(),
            });
        }
        Ok(())
    }

    /// Fill `out` from the front of the queue, returning the element count
    pub fn read(&self, out: &mut [T]) -> usize {
        let mut read = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(value) => {
                    *slot = value;
                    read += 1;
                }
                None => break,
            }
        }
        if read < out.len() {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        read
    }

    /// Pop a single element
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Drop up to `count` elements from the front, returning how many went
    pub fn discard(&self, count: usize) -> usize {
        let mut dropped = 0;
        while dropped < count && self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Discard everything currently buffered
    pub fn flush(&self) -> usize {
        // Bounded so a concurrent writer cannot keep us here forever
        self.discard(self.queue.capacity())
    }

    pub fn available_to_read(&self) -> usize {
        self.queue.len()
    }

    pub fn available_to_write(&self) -> usize {
        self.queue.capacity() - self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Elements dropped by truncated writes
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Reads that came back short
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.available_to_read() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a byte FIFO
pub type SharedByteFifo = Arc<ByteFifo>;

/// Create a new shared byte FIFO
pub fn create_shared_fifo(bytes: usize) -> Result<SharedByteFifo, BufferError> {
    Ok(Arc::new(ByteFifo::new(bytes, false)?))
}
