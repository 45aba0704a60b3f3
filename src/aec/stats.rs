//! Pipeline counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the capture path and the worker
#[derive(Debug, Default)]
pub struct AecStats {
    quanta_processed: AtomicU64,
    quanta_cancelled: AtomicU64,
    quanta_passthrough: AtomicU64,
    divergences: AtomicU64,
    missing_reference: AtomicU64,
    canceller_failures: AtomicU64,
    flushes: AtomicU64,
    underruns: AtomicU64,
    blocks_not_ready: AtomicU64,
    short_writes: AtomicU64,
}

macro_rules! counter {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl AecStats {
            $(
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Point-in-time copy of every counter
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }

            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
            }
        }

        /// Serializable view of [`AecStats`]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct StatsSnapshot {
            $(pub $field: u64,)*
        }
    };
}

counter! {
    quanta_processed => inc_processed,
    quanta_cancelled => inc_cancelled,
    quanta_passthrough => inc_passthrough,
    divergences => inc_divergence,
    missing_reference => inc_missing_reference,
    canceller_failures => inc_canceller_failure,
    flushes => inc_flush,
    underruns => inc_underrun,
    blocks_not_ready => inc_not_ready,
    short_writes => inc_short_write,
}

impl StatsSnapshot {
    /// Fraction of processed quanta that were actually cancelled
    pub fn cancel_ratio(&self) -> f64 {
        if self.quanta_processed == 0 {
            return 0.0;
        }
        self.quanta_cancelled as f64 / self.quanta_processed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = AecStats::default();
        stats.inc_processed();
        stats.inc_processed();
        stats.inc_cancelled();
        stats.inc_divergence();

        let snap = stats.snapshot();
        assert_eq!(snap.quanta_processed, 2);
        assert_eq!(snap.quanta_cancelled, 1);
        assert_eq!(snap.divergences, 1);
        assert!((snap.cancel_ratio() - 0.5).abs() < f64::EPSILON);

        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"divergences\":1"));

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
