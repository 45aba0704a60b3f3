//! Pipeline configuration
//!
//! Loaded from TOML. Every field has a default so a partial file (or no file
//! at all) yields a usable configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::aec::canceller::CancellerKind;
use crate::audio::conditioner::DownmixMode;
use crate::audio::resampler::ResamplerKind;
use crate::constants::*;
use crate::error::{Error, Result};

/// Name of the config file looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "aec-sync.toml";

/// Echo cancellation pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AecConfig {
    /// Maximum |mic_time - reference_time| before a quantum counts as diverged
    pub max_timestamp_diff_us: u64,

    /// Microphone frames processed per worker wake
    pub quantum_frames: usize,

    /// Channel count the canceller expects for the reference signal
    pub reference_channels: u16,

    /// How a multi-channel reference is folded to mono
    pub downmix: DownmixMode,

    /// Reference sample rate converter
    pub resampler: ResamplerKind,

    /// Cancellation algorithm
    pub canceller: CancellerKind,

    /// NLMS adaptive filter length in taps
    pub nlms_filter_len: usize,

    /// NLMS step size (0.0..1.0)
    pub nlms_step_size: f32,

    /// Frames per playback period
    pub reference_period_frames: usize,

    /// Playback periods held by the reference FIFO
    pub reference_period_count: usize,

    /// Quanta held by the microphone FIFO
    pub mic_fifo_quanta: usize,

    /// Quanta held by the output FIFO
    pub output_fifo_quanta: usize,

    /// Capacity of each timestamp queue, in records
    pub timestamp_fifo_records: usize,

    /// How long the capture path waits for the worker, in milliseconds
    pub worker_timeout_ms: u64,

    /// Directory for raw/cancelled/reference PCM dumps
    pub debug_dump_dir: Option<PathBuf>,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            max_timestamp_diff_us: MAX_TIMESTAMP_DIFF_USEC,
            quantum_frames: DEFAULT_QUANTUM_FRAMES,
            reference_channels: DEFAULT_REFERENCE_CHANNELS,
            downmix: DownmixMode::Average,
            resampler: ResamplerKind::Linear,
            canceller: CancellerKind::Nlms,
            nlms_filter_len: 256,
            nlms_step_size: 0.5,
            reference_period_frames: PLAYBACK_PERIOD_FRAMES,
            reference_period_count: PLAYBACK_PERIOD_COUNT,
            mic_fifo_quanta: 8,
            output_fifo_quanta: 8,
            timestamp_fifo_records: 64,
            worker_timeout_ms: 20,
            debug_dump_dir: None,
        }
    }
}

impl AecConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading AEC config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Platform-specific location of the config file
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "aec-sync").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.quantum_frames == 0 {
            return Err(Error::Config("quantum_frames must be non-zero".into()));
        }
        if self.reference_channels == 0 {
            return Err(Error::Config("reference_channels must be non-zero".into()));
        }
        if self.reference_period_frames == 0 || self.reference_period_count == 0 {
            return Err(Error::Config("reference FIFO size must be non-zero".into()));
        }
        if self.mic_fifo_quanta == 0 || self.output_fifo_quanta == 0 {
            return Err(Error::Config("mic/output FIFO size must be non-zero".into()));
        }
        if self.timestamp_fifo_records == 0 {
            return Err(Error::Config("timestamp_fifo_records must be non-zero".into()));
        }
        if self.nlms_filter_len == 0 {
            return Err(Error::Config("nlms_filter_len must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.nlms_step_size) {
            return Err(Error::Config(format!(
                "nlms_step_size {} outside 0.0..=1.0",
                self.nlms_step_size
            )));
        }
        Ok(())
    }

    /// Worker wait as a `Duration`
    pub fn worker_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.worker_timeout_ms)
    }
}
