//! Byte-ledger timestamp reconstruction
//!
//! Producers stamp every write once. The consumer reads arbitrary-sized
//! blocks, so a read can start in the middle of a write packet or span
//! several of them. The tracker keeps a signed ledger of
//! `bytes read - bytes announced by dequeued records`:
//!
//! * `ledger < 0`: the last dequeued packet is only partly consumed; the
//!   next read starts `bytes_written + ledger` bytes into it.
//! * `ledger >= 0`: the next read starts on a fresh packet whose record is
//!   still in the timestamp queue.
//!
//! After each read the tracker fast-forwards through records of packets the
//! read fully crossed, so the next call starts from the right packet.

use tracing::{debug, error};

use crate::audio::buffer::TimestampFifo;
use crate::audio::format::StreamFormat;
use crate::sync::timestamp::TimestampRecord;

#[derive(Debug, Clone, Default)]
pub struct TimestampTracker {
    read_write_diff_bytes: i64,
    last: TimestampRecord,
    bytes_read_total: u64,
    bytes_dequeued_total: u64,
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wall-clock time (usec) of the first frame of the `bytes_read` block
    /// just taken from the audio queue. Returns 0 when no timestamp record
    /// is available, which callers treat as "no valid data".
    pub fn resolve(
        &mut self,
        timestamps: &TimestampFifo,
        format: &StreamFormat,
        bytes_read: usize,
    ) -> u64 {
        let usec_per_byte = format.usec_per_byte();
        let mut offset_usec = 0u64;

        if self.read_write_diff_bytes < 0 {
            // Still inside the previous packet
            let consumed = (self.last.bytes_written as i64 + self.read_write_diff_bytes).max(0);
            offset_usec = (consumed as f64 * usec_per_byte) as u64;
            debug!("Reusing previous timestamp, offset {} usec", offset_usec);
        } else {
            match timestamps.pop() {
                Some(record) => self.dequeue(record),
                None => {
                    error!("Timestamp error: no new timestamps!");
                    self.account_read(bytes_read);
                    return 0;
                }
            }
        }

        let first_frame_usec = self.last.time.as_usec() + offset_usec;

        self.account_read(bytes_read);
        while self.read_write_diff_bytes > 0 {
            let Some(record) = timestamps.pop() else {
                debug!("At the end of timestamp FIFO");
                break;
            };
            self.dequeue(record);
            debug!(
                "Fast-forwarded timestamp by {} bytes, remaining {} bytes, new timestamp {} usec",
                record.bytes_written,
                self.read_write_diff_bytes,
                record.time.as_usec()
            );
        }

        first_frame_usec
    }

    fn dequeue(&mut self, record: TimestampRecord) {
        self.last = record;
        self.read_write_diff_bytes -= record.bytes_written as i64;
        self.bytes_dequeued_total += record.bytes_written.max(0) as u64;
    }

    fn account_read(&mut self, bytes_read: usize) {
        self.read_write_diff_bytes += bytes_read as i64;
        self.bytes_read_total += bytes_read as u64;
    }

    /// Zero the ledger after the queues were flushed
    pub fn reset(&mut self) {
        self.read_write_diff_bytes = 0;
        self.bytes_read_total = 0;
        self.bytes_dequeued_total = 0;
    }

    /// Signed byte ledger
    pub fn read_write_diff_bytes(&self) -> i64 {
        self.read_write_diff_bytes
    }

    pub fn last_record(&self) -> &TimestampRecord {
        &self.last
    }

    /// Bytes reported as read since the last reset
    pub fn bytes_read_total(&self) -> u64 {
        self.bytes_read_total
    }

    /// Sum of `bytes_written` over records dequeued since the last reset
    pub fn bytes_dequeued_total(&self) -> u64 {
        self.bytes_dequeued_total
    }
}
