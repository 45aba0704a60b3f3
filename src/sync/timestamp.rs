//! Wall-clock timestamps attached to FIFO writes

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Seconds + nanoseconds wall-clock instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub fn from_usec(usec: u64) -> Self {
        Self {
            sec: (usec / 1_000_000) as i64,
            nsec: ((usec % 1_000_000) * 1000) as u32,
        }
    }

    /// Microseconds, sub-microsecond part truncated. Negative instants map to 0.
    pub fn as_usec(&self) -> u64 {
        if self.sec < 0 {
            return 0;
        }
        self.sec as u64 * 1_000_000 + (self.nsec / 1000) as u64
    }
}

/// One record per producer write: when it happened and how many bytes it carried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampRecord {
    pub time: Timespec,
    /// Frames still queued in the hardware buffer when the stamp was taken
    pub frames_available: u32,
    /// Length of the audio chunk this record belongs to
    pub bytes_written: isize,
}

impl TimestampRecord {
    pub fn new(time: Timespec, frames_available: u32, bytes_written: isize) -> Self {
        Self {
            time,
            frames_available,
            bytes_written,
        }
    }
}

/// A stream clock sampled right after each read/write
pub trait TimestampSource: Send + Sync {
    /// Current presentation/capture time and frames still buffered in hardware.
    /// `None` means the hardware could not provide one.
    fn now(&self) -> Option<(Timespec, u32)>;
}

/// System real-time clock, used when no hardware clock is attached
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimestampSource for SystemClock {
    fn now(&self) -> Option<(Timespec, u32)> {
        let now = Utc::now();
        Some((
            Timespec::new(now.timestamp(), now.timestamp_subsec_nanos()),
            0,
        ))
    }
}

/// Take a stamp from `source`, falling back to the system clock
pub fn stamp(source: Option<&dyn TimestampSource>) -> (Timespec, u32) {
    source
        .and_then(|s| s.now())
        .or_else(|| SystemClock.now())
        .unwrap_or_default()
}

/// Clock driven by hand, for tests and simulations
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    inner: Arc<Mutex<(Timespec, u32)>>,
}

impl ManualClock {
    pub fn new(start_usec: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new((Timespec::from_usec(start_usec), 0))),
        }
    }

    pub fn set_usec(&self, usec: u64) {
        self.inner.lock().0 = Timespec::from_usec(usec);
    }

    pub fn advance_usec(&self, usec: u64) {
        let mut guard = self.inner.lock();
        guard.0 = Timespec::from_usec(guard.0.as_usec() + usec);
    }

    pub fn set_frames_available(&self, frames: u32) {
        self.inner.lock().1 = frames;
    }

    pub fn usec(&self) -> u64 {
        self.inner.lock().0.as_usec()
    }
}

impl TimestampSource for ManualClock {
    fn now(&self) -> Option<(Timespec, u32)> {
        Some(*self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usec_truncates() {
        assert_eq!(Timespec::new(2, 1_999).as_usec(), 2_000_001);
        assert_eq!(Timespec::new(-1, 0).as_usec(), 0);
        assert_eq!(Timespec::from_usec(3_500_250).as_usec(), 3_500_250);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance_usec(500);
        clock.set_frames_available(12);
        assert_eq!(clock.now(), Some((Timespec::from_usec(1_500), 12)));
    }

    #[test]
    fn test_stamp_falls_back_to_system_clock() {
        struct Broken;
        impl TimestampSource for Broken {
            fn now(&self) -> Option<(Timespec, u32)> {
                None
            }
        }
        let (time, _) = stamp(Some(&Broken));
        assert!(time.as_usec() > 0);
    }
}
