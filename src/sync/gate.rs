//! Decides per quantum whether echo cancellation may run
//!
//! Two independent axes: is the reference stream running, and do the mic and
//! reference timestamps agree. Anything other than (running, converged) ends
//! in raw microphone passthrough.

use std::fmt;

/// Reference activity as seen by one capture block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Reference stopped: pass the mic through untouched
    NotRunning,
    /// Reference went false -> true since the previous block: flush and reset
    Started,
    /// Reference running and already synchronized
    Running,
}

/// Externally toggled `running` flag plus the value seen by the last block
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningState {
    running: bool,
    prev_running: bool,
}

impl RunningState {
    pub fn set(&mut self, running: bool) {
        self.running = running;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Classify the current block and remember what it saw
    pub fn observe(&mut self) -> Transition {
        let transition = match (self.prev_running, self.running) {
            (_, false) => Transition::NotRunning,
            (false, true) => Transition::Started,
            (true, true) => Transition::Running,
        };
        self.prev_running = self.running;
        transition
    }

    /// Forget everything (endpoint torn down)
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Why a quantum was not cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    MissingMicTimestamp,
    MissingReferenceTimestamp,
    Drift { diff_us: u64 },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::MissingMicTimestamp => write!(f, "no mic timestamp"),
            Divergence::MissingReferenceTimestamp => write!(f, "no reference timestamp"),
            Divergence::Drift { diff_us } => write!(f, "timestamps {} usec apart", diff_us),
        }
    }
}

/// Timestamp convergence check
#[derive(Debug, Clone, Copy)]
pub struct SyncGate {
    max_diff_us: u64,
}

impl SyncGate {
    pub fn new(max_diff_us: u64) -> Self {
        Self { max_diff_us }
    }

    pub fn max_diff_us(&self) -> u64 {
        self.max_diff_us
    }

    /// `Ok(diff)` if the streams are close enough to cancel
    pub fn check(&self, mic_time_us: u64, reference_time_us: u64) -> Result<u64, Divergence> {
        if mic_time_us == 0 {
            return Err(Divergence::MissingMicTimestamp);
        }
        if reference_time_us == 0 {
            return Err(Divergence::MissingReferenceTimestamp);
        }
        let diff_us = mic_time_us.abs_diff(reference_time_us);
        if diff_us > self.max_diff_us {
            return Err(Divergence::Drift { diff_us });
        }
        Ok(diff_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_transitions() {
        let mut state = RunningState::default();
        assert_eq!(state.observe(), Transition::NotRunning);

        state.set(true);
        assert_eq!(state.observe(), Transition::Started);
        assert_eq!(state.observe(), Transition::Running);

        state.set(false);
        assert_eq!(state.observe(), Transition::NotRunning);
        state.set(true);
        assert_eq!(state.observe(), Transition::Started);
    }

    #[test]
    fn test_gate_tolerance() {
        let gate = SyncGate::new(200_000);
        assert_eq!(gate.check(1_000_000, 1_150_000), Ok(150_000));
        assert_eq!(gate.check(1_200_000, 1_000_000), Ok(200_000));
        assert_eq!(
            gate.check(1_000_000, 1_200_001),
            Err(Divergence::Drift { diff_us: 200_001 })
        );
    }

    #[test]
    fn test_gate_zero_timestamps() {
        let gate = SyncGate::new(200_000);
        assert_eq!(gate.check(0, 5), Err(Divergence::MissingMicTimestamp));
        assert_eq!(gate.check(5, 0), Err(Divergence::MissingReferenceTimestamp));
    }
}
