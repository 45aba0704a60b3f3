//! # AEC Sync
//!
//! Timestamp-synchronized acoustic echo cancellation between a playback
//! stream and a capture stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             PLAYBACK THREAD                                 │
//! │   write_reference_block(pcm)                                                │
//! │         │                                                                   │
//! │         ▼                                                                   │
//! │  ┌──────────────────────┐   ┌──────────────────────┐                        │
//! │  │ Reference Audio FIFO │   │ Reference Timestamps │  one record per write  │
//! │  └──────────┬───────────┘   └──────────┬───────────┘                        │
//! └─────────────┼──────────────────────────┼────────────────────────────────────┘
//!               │                          │
//! ┌─────────────┼──────────────────────────┼────────────────────────────────────┐
//! │             │        AEC WORKER        │                                    │
//! │             ▼                          ▼                                    │
//! │  ┌──────────────────────────────────────────────┐                           │
//! │  │ Reference Conditioner (audio::conditioner)   │                           │
//! │  │  right-align -> downmix -> resample -> <<16  │                           │
//! │  └──────────────────────┬───────────────────────┘                           │
//! │                         │ ref block + ref time (sync::tracker)              │
//! │                         ▼                                                   │
//! │  ┌──────────────────────────────────────────────┐     diverged / error      │
//! │  │ Sync Gate (sync::gate): |mic - ref| <= 200ms ├──────► passthrough,       │
//! │  └──────────────────────┬───────────────────────┘        flush + reset      │
//! │                         │ ok                                                │
//! │                         ▼                                                   │
//! │  ┌──────────────────────────────────────────────┐                           │
//! │  │ Echo Canceller (aec::canceller)              │                           │
//! │  └──────────────────────┬───────────────────────┘                           │
//! └─────────────────────────┼───────────────────────────────────────────────────┘
//!               ▲           │                          ▲
//!               │           ▼                          │ mic block + mic time
//! ┌─────────────┼──────────────────────────────────────┼────────────────────────┐
//! │             │ WorkItem     ┌─────────────┐  ┌──────┴──────┐  ┌───────────┐  │
//! │             │              │ Output FIFO │  │  Mic FIFO   │  │ Mic Times │  │
//! │             │              └──────┬──────┘  └──────▲──────┘  └─────▲─────┘  │
//! │             │                     │                │               │        │
//! │   process_capture_block(&mut pcm) ┴────────────────┴───────────────┘        │
//! │                             CAPTURE THREAD                                  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod aec;
pub mod audio;
pub mod config;
pub mod error;
pub mod sync;

pub use aec::{AecContext, EndpointConfig};
pub use config::AecConfig;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Largest accepted |mic_time - reference_time|, in microseconds
    pub const MAX_TIMESTAMP_DIFF_USEC: u64 = 200_000;

    /// Typical playback (echo reference) sample rate
    pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;

    /// Frames per playback period
    pub const PLAYBACK_PERIOD_FRAMES: usize = 512;

    /// Playback periods buffered as echo reference
    pub const PLAYBACK_PERIOD_COUNT: usize = 4;

    /// Typical capture sample rate
    pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

    /// Mic frames per worker quantum (10 ms at 16 kHz)
    pub const DEFAULT_QUANTUM_FRAMES: usize = 160;

    /// Reference channels handed to the canceller
    pub const DEFAULT_REFERENCE_CHANNELS: u16 = 1;
}
