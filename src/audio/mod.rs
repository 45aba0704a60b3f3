//! Audio subsystem module
//!
//! PCM formats, the lock-free FIFOs both stream directions are queued in,
//! and the conversion chain that turns loudspeaker audio into an echo
//! reference.

pub mod buffer;
pub mod conditioner;
pub mod format;
pub mod resampler;

pub use buffer::{ByteFifo, Fifo, TimestampFifo};
pub use conditioner::{DownmixMode, ReferenceConditioner};
pub use format::{SampleFormat, StreamFormat};
pub use resampler::{create_resampler, Resampler, ResamplerKind};
