//! Stream timestamps and synchronization
//!
//! Every producer write is stamped once; the consumer reconstructs the time
//! of whatever block it reads from those stamps, and the gate compares the
//! two directions before cancellation is allowed to run.

pub mod gate;
pub mod timestamp;
pub mod tracker;

pub use gate::{Divergence, RunningState, SyncGate, Transition};
pub use timestamp::{ManualClock, SystemClock, Timespec, TimestampRecord, TimestampSource};
pub use tracker::TimestampTracker;
