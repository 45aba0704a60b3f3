//! Echo cancellation pipeline
//!
//! Wires the reference and microphone endpoints, the worker thread and the
//! canceller together behind [`AecContext`].

pub mod canceller;
pub mod context;
pub mod dump;
pub mod endpoint;
pub mod pipeline;
pub mod stats;
pub mod worker;

pub use canceller::{create_canceller, CancellerKind, CancellerParams, EchoCanceller};
pub use context::{AecContext, QueueLevels};
pub use endpoint::EndpointConfig;
pub use pipeline::{PassthroughReason, QuantumOutcome};
pub use stats::StatsSnapshot;
