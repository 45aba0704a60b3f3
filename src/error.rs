//! Error types for the echo cancellation pipeline

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Resampler error: {0}")]
    Resampler(#[from] ResamplerError),

    #[error("Canceller error: {0}")]
    Canceller(#[from] CancellerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// FIFO errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Could only write {written} of {requested} bytes")]
    ShortWrite { written: usize, requested: usize },

    #[error("Invalid buffer capacity: {0}")]
    InvalidCapacity(usize),
}

/// Sample rate conversion errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResamplerError {
    #[error("Resampler initialization failed: {0}")]
    Init(String),

    #[error("Resampling failed: {0}")]
    Process(String),

    #[error("Output buffer too small: need {needed} frames, have {available}")]
    OutputTooSmall { needed: usize, available: usize },
}

/// Cancellation algorithm errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CancellerError {
    #[error("Canceller initialization failed: {0}")]
    Init(String),

    #[error("Canceller returned status {0}")]
    Process(i32),

    #[error("Frame count mismatch: expected {expected}, got {actual}")]
    FrameMismatch { expected: usize, actual: usize },
}

/// Capture/playback pipeline errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{0} endpoint is not configured")]
    NotConfigured(&'static str),

    #[error("Output underrun: {available} of {requested} bytes available")]
    Underrun { available: usize, requested: usize },

    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    #[error("Worker thread is not running")]
    WorkerGone,

    #[error("No echo reference data available")]
    NoReferenceData,

    #[error("Block of {0} bytes is not a whole number of frames")]
    InvalidBlock(usize),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
