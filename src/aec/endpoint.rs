//! One stream direction: audio FIFO, timestamp FIFO and the consumer ledger

use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::audio::buffer::{ByteFifo, TimestampFifo};
use crate::audio::format::StreamFormat;
use crate::error::{BufferError, Result};
use crate::sync::timestamp::{stamp, TimestampRecord, TimestampSource};
use crate::sync::tracker::TimestampTracker;

/// How a stream direction is opened
#[derive(Clone)]
pub struct EndpointConfig {
    pub format: StreamFormat,
    /// Hardware clock of the live stream; `None` uses the system clock
    pub clock: Option<Arc<dyn TimestampSource>>,
}

impl EndpointConfig {
    pub fn new(format: StreamFormat) -> Self {
        Self { format, clock: None }
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimestampSource>) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("format", &self.format)
            .field("hw_clock", &self.clock.is_some())
            .finish()
    }
}

/// The two FIFOs of one direction, shared between producer and consumer
pub struct EndpointQueues {
    pub audio: ByteFifo,
    pub timestamps: TimestampFifo,
}

impl EndpointQueues {
    pub fn new(audio_bytes: usize, timestamp_records: usize) -> Result<Self> {
        Ok(Self {
            audio: ByteFifo::new(audio_bytes, false)?,
            timestamps: TimestampFifo::new(timestamp_records, false)?,
        })
    }

    pub fn flush(&self) {
        self.audio.flush();
        self.timestamps.flush();
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.timestamps.is_empty()
    }
}

/// Producer side of an endpoint, usable without holding the context lock
#[derive(Clone)]
pub struct EndpointProducer {
    name: &'static str,
    format: StreamFormat,
    queues: Arc<EndpointQueues>,
    clock: Option<Arc<dyn TimestampSource>>,
}

impl EndpointProducer {
    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn queues(&self) -> &EndpointQueues {
        &self.queues
    }

    /// A fresh consumer over the same queues, with an empty ledger.
    /// Only one consumer may read the queues at a time.
    pub fn consumer(&self) -> StreamEndpoint {
        StreamEndpoint {
            name: self.name,
            format: self.format,
            queues: self.queues.clone(),
            clock: self.clock.clone(),
            tracker: TimestampTracker::new(),
        }
    }

    /// Enqueue one chunk, then the record stamping it.
    ///
    /// The record always carries the byte count that actually went in, so a
    /// short write keeps the ledger consistent; it is still reported.
    pub fn push(&self, data: &[u8]) -> std::result::Result<usize, BufferError> {
        let written = self.queues.audio.write(data);
        let (time, frames_available) = stamp(self.clock.as_deref());
        let record = TimestampRecord::new(time, frames_available, written as isize);
        if self.queues.timestamps.write(&[record]) != 1 {
            warn!("{}: timestamp FIFO full, record dropped", self.name);
        }

        trace!(
            "{} queue (post-write): audio {} bytes ({:.0}% full), timestamps {}",
            self.name,
            self.queues.audio.available_to_read(),
            self.queues.audio.fill_level() * 100.0,
            self.queues.timestamps.available_to_read()
        );

        if written != data.len() {
            warn!("{}: could only write {} of {} bytes", self.name, written, data.len());
            return Err(BufferError::ShortWrite {
                written,
                requested: data.len(),
            });
        }
        Ok(written)
    }
}

/// A configured stream direction
pub struct StreamEndpoint {
    name: &'static str,
    format: StreamFormat,
    queues: Arc<EndpointQueues>,
    clock: Option<Arc<dyn TimestampSource>>,
    tracker: TimestampTracker,
}

impl StreamEndpoint {
    pub fn new(
        name: &'static str,
        config: EndpointConfig,
        audio_bytes: usize,
        timestamp_records: usize,
    ) -> Result<Self> {
        Ok(Self {
            name,
            format: config.format,
            queues: Arc::new(EndpointQueues::new(audio_bytes, timestamp_records)?),
            clock: config.clock,
            tracker: TimestampTracker::new(),
        })
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub fn queues(&self) -> &EndpointQueues {
        &self.queues
    }

    pub fn tracker(&self) -> &TimestampTracker {
        &self.tracker
    }

    pub fn producer(&self) -> EndpointProducer {
        EndpointProducer {
            name: self.name,
            format: self.format,
            queues: self.queues.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Producer write without going through a cloned handle
    pub fn push(&self, data: &[u8]) -> std::result::Result<usize, BufferError> {
        self.producer().push(data)
    }

    pub fn available_to_read(&self) -> usize {
        self.queues.audio.available_to_read()
    }

    /// Consume up to `buf.len()` bytes and resolve the first frame's time
    pub fn read_block(&mut self, buf: &mut [u8]) -> (usize, u64) {
        let read = self.queues.audio.read(buf);
        let time = self
            .tracker
            .resolve(&self.queues.timestamps, &self.format, read);
        (read, time)
    }

    /// Split borrow for the conditioner: queues plus the mutable ledger
    pub fn parts_mut(&mut self) -> (&EndpointQueues, &mut TimestampTracker) {
        (&self.queues, &mut self.tracker)
    }

    /// Empty both queues and zero the ledger
    pub fn flush(&mut self) {
        self.queues.flush();
        self.tracker.reset();
    }
}

impl fmt::Debug for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEndpoint")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("queued_bytes", &self.queues.audio.available_to_read())
            .finish()
    }
}
