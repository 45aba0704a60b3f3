//! PCM stream formats and little-endian sample packing

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Sample encoding of an interleaved PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Signed 16-bit little-endian
    S16Le,
    /// Signed 32-bit little-endian
    S32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S32Le => 4,
        }
    }
}

/// Rate, channel count and sample encoding of one stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_size_bytes(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    pub fn bytes_for_frames(&self, frames: usize) -> usize {
        frames * self.frame_size_bytes()
    }

    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / self.frame_size_bytes()
    }

    /// Wall-clock microseconds covered by one byte of this stream
    pub fn usec_per_byte(&self) -> f64 {
        1_000_000.0 / (self.frame_size_bytes() as f64 * self.sample_rate as f64)
    }

    /// Check that `bytes` holds whole frames
    pub fn check_block(&self, bytes: usize) -> Result<usize, PipelineError> {
        let frame = self.frame_size_bytes();
        if frame == 0 || bytes % frame != 0 {
            return Err(PipelineError::InvalidBlock(bytes));
        }
        Ok(bytes / frame)
    }
}

/// Unpack little-endian 16-bit samples
pub fn read_i16_samples(bytes: &[u8], out: &mut [i16]) {
    for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *sample = i16::from_le_bytes([chunk[0], chunk[1]]);
    }
}

/// Unpack PCM bytes into 32-bit samples; 16-bit input is shifted into the
/// upper half so both formats share one full-scale range.
pub fn read_i32_samples(bytes: &[u8], format: SampleFormat, out: &mut [i32]) {
    match format {
        SampleFormat::S16Le => {
            for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *sample = (i16::from_le_bytes([chunk[0], chunk[1]]) as i32) << 16;
            }
        }
        SampleFormat::S32Le => {
            for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *sample = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
    }
}

/// Pack 32-bit samples back into the stream's byte format
pub fn write_i32_samples(samples: &[i32], format: SampleFormat, out: &mut [u8]) {
    match format {
        SampleFormat::S16Le => {
            for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(2)) {
                chunk.copy_from_slice(&((*sample >> 16) as i16).to_le_bytes());
            }
        }
        SampleFormat::S32Le => {
            for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(4)) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
        }
    }
}

/// Pack 16-bit samples as little-endian bytes
pub fn write_i16_samples(samples: &[i16], out: &mut [u8]) {
    for (sample, chunk) in samples.iter().zip(out.chunks_exact_mut(2)) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}
