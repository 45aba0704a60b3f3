//! Echo reference conditioning
//!
//! Turns a block of loudspeaker PCM (playback rate, N channels, 16-bit) into
//! a block matching the microphone quantum (capture rate, reference
//! channels, 32-bit):
//!
//! ```text
//! FIFO bytes -> right-align short reads -> downmix -> resample -> widen << 16
//! ```
//!
//! Downmix runs before resampling because the resampler is built for the
//! target channel count; widening runs last because the resampler is 16-bit.
//!
//! Frames the resampler leaves unconsumed are carried into the next quantum
//! and only the remainder is read from the FIFO, so the reference advances
//! at exactly the playback rate.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::audio::buffer::{ByteFifo, TimestampFifo};
use crate::audio::format::{read_i16_samples, SampleFormat, StreamFormat};
use crate::audio::resampler::{create_resampler, Resampler, ResamplerKind};
use crate::error::{Error, PipelineError, Result};
use crate::sync::tracker::TimestampTracker;

/// How N reference channels are folded into one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownmixMode {
    /// Integer mean of all channels
    Average,
    /// Sum scaled by a Q16 gain of `65536 / N`
    GainScaledSum,
}

/// Fold `from_channels` interleaved channels down to `to_channels`, in place.
///
/// Only N -> N (no-op) and N -> 1 are supported; anything else is logged and
/// leaves the samples untouched. Returns whether the data now has
/// `to_channels` channels.
pub fn downmix_in_place(
    samples: &mut [i16],
    frames: usize,
    from_channels: usize,
    to_channels: usize,
    mode: DownmixMode,
) -> bool {
    if from_channels == to_channels {
        return true;
    }
    if to_channels != 1 || from_channels == 0 {
        error!(
            "Unsupported downmix {} -> {} channels, reference left untouched",
            from_channels, to_channels
        );
        return false;
    }

    let frames = frames.min(samples.len() / from_channels);
    let gain_q16 = 65_536 / from_channels as i64;
    for frame in 0..frames {
        let start = frame * from_channels;
        let sum: i64 = samples[start..start + from_channels]
            .iter()
            .map(|&s| s as i64)
            .sum();
        let mixed = match mode {
            DownmixMode::Average => sum / from_channels as i64,
            DownmixMode::GainScaledSum => (sum * gain_q16) >> 16,
        };
        // frame <= start, so the write never clobbers unread input
        samples[frame] = mixed.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
    }
    true
}

/// Move the first `valid` bytes to the end of `block` and zero the front,
/// so missing reference data shows up as leading silence.
pub fn right_align(block: &mut [u8], valid: usize) {
    let valid = valid.min(block.len());
    let pad = block.len() - valid;
    if pad == 0 {
        return;
    }
    block.copy_within(0..valid, pad);
    block[..pad].fill(0);
}

/// 16-bit -> 32-bit sample width conversion
pub fn widen(src: &[i16], dst: &mut [i32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = (s as i32) << 16;
    }
}

/// Reads, aligns, downmixes, resamples and widens one reference block per
/// microphone quantum.
pub struct ReferenceConditioner {
    reference: StreamFormat,
    mic_rate: u32,
    mic_frames: usize,
    target_channels: usize,
    mode: DownmixMode,
    resampler: Box<dyn Resampler>,
    raw: Vec<u8>,
    playback: Vec<i16>,
    /// Downmixed frames offered to the resampler: carry, then fresh input
    offered: Vec<i16>,
    /// Downmixed frames the resampler did not consume last time
    carry: Vec<i16>,
    resampled: Vec<i16>,
    widened: Vec<i32>,
}

impl ReferenceConditioner {
    pub fn new(
        reference: StreamFormat,
        mic_rate: u32,
        mic_frames: usize,
        target_channels: u16,
        mode: DownmixMode,
        resampler: ResamplerKind,
    ) -> Result<Self> {
        if reference.sample_format != SampleFormat::S16Le {
            return Err(Error::Config(format!(
                "echo reference must be 16-bit, got {:?}",
                reference.sample_format
            )));
        }
        if mic_rate == 0 || reference.sample_rate == 0 || reference.channels == 0 {
            return Err(Error::Config("reference/mic rate and channels must be non-zero".into()));
        }

        let target_channels = target_channels as usize;
        if reference.channels as usize != target_channels && target_channels != 1 {
            warn!(
                "Reference has {} channels but {} are expected; only downmix to mono is supported",
                reference.channels, target_channels
            );
        }

        let in_frames = input_frames_for(mic_frames, reference.sample_rate, mic_rate);
        let resampler = create_resampler(
            resampler,
            reference.sample_rate,
            mic_rate,
            target_channels,
            in_frames,
        )?;

        let samples_in = in_frames * reference.channels as usize;
        Ok(Self {
            reference,
            mic_rate,
            mic_frames,
            target_channels,
            mode,
            resampler,
            raw: vec![0; samples_in * 2],
            playback: vec![0; samples_in.max(in_frames * target_channels)],
            offered: vec![0; in_frames * target_channels],
            carry: Vec::with_capacity(in_frames * target_channels),
            resampled: vec![0; mic_frames * target_channels],
            widened: vec![0; mic_frames * target_channels],
        })
    }

    /// Reference frames needed (pre-resample) for one quantum
    pub fn input_frames(&self) -> usize {
        input_frames_for(self.mic_frames, self.reference.sample_rate, self.mic_rate)
    }

    /// Frames carried over from the previous quantum
    pub fn carried_frames(&self) -> usize {
        self.carry.len() / self.target_channels
    }

    /// Pull one quantum of reference from `audio` and return the timestamp
    /// of its first frame. The conditioned block is then in [`Self::reference`].
    ///
    /// An empty FIFO zeroes the reference and fails with `NoReferenceData`.
    pub fn condition(
        &mut self,
        audio: &ByteFifo,
        timestamps: &TimestampFifo,
        tracker: &mut TimestampTracker,
    ) -> Result<u64> {
        let in_frames = self.input_frames();
        let tc = self.target_channels;

        // At least one fresh frame per quantum keeps the ledger moving
        let max_carry = (in_frames - 1) * tc;
        if self.carry.len() > max_carry {
            debug!(
                "Dropping {} carried reference frames",
                (self.carry.len() - max_carry) / tc
            );
            self.carry.drain(..self.carry.len() - max_carry);
        }
        let carried = self.carry.len() / tc;
        let fresh_frames = in_frames - carried;
        let req_bytes = self.reference.bytes_for_frames(fresh_frames);

        if audio.available_to_read() == 0 {
            debug!("Echo reference buffer empty, zeroing reference");
            self.widened.fill(0);
            return Err(PipelineError::NoReferenceData.into());
        }

        debug!(
            "Queue available (pre-read): reference {} bytes, {} timestamps",
            audio.available_to_read(),
            timestamps.available_to_read()
        );
        let read_bytes = audio.read(&mut self.raw[..req_bytes]);
        let timestamp = tracker.resolve(timestamps, &self.reference, read_bytes);

        if read_bytes == 0 {
            error!("Reference FIFO read returned nothing");
            self.widened.fill(0);
            return Err(PipelineError::NoReferenceData.into());
        }
        if read_bytes < req_bytes {
            warn!("Could only read {} of {} reference bytes", read_bytes, req_bytes);
            right_align(&mut self.raw[..req_bytes], read_bytes);
        }

        let ref_channels = self.reference.channels as usize;
        let samples_in = fresh_frames * ref_channels;
        read_i16_samples(&self.raw[..req_bytes], &mut self.playback[..samples_in]);
        downmix_in_place(
            &mut self.playback,
            fresh_frames,
            ref_channels,
            tc,
            self.mode,
        );

        self.offered[..carried * tc].copy_from_slice(&self.carry);
        self.offered[carried * tc..in_frames * tc].copy_from_slice(&self.playback[..fresh_frames * tc]);

        let mut consumed = in_frames;
        let mut produced = self.mic_frames;
        self.resampler.resample(
            &self.offered[..in_frames * tc],
            &mut consumed,
            &mut self.resampled,
            &mut produced,
        )?;
        self.carry.clear();
        self.carry
            .extend_from_slice(&self.offered[consumed.min(in_frames) * tc..in_frames * tc]);
        if produced < self.mic_frames {
            debug!(
                "Resampler produced {} of {} frames, padding with silence",
                produced, self.mic_frames
            );
            self.resampled[produced * self.target_channels..].fill(0);
        }

        widen(&self.resampled, &mut self.widened);

        // The block starts with the carried frames, which precede the read
        if timestamp == 0 || carried == 0 {
            return Ok(timestamp);
        }
        let carried_usec = carried as u64 * 1_000_000 / self.reference.sample_rate as u64;
        Ok(timestamp.saturating_sub(carried_usec))
    }

    /// Last conditioned block: mic rate, reference channels, 32-bit
    pub fn reference(&self) -> &[i32] {
        &self.widened
    }

    /// Last block after alignment and downmix, before resampling
    pub fn pre_resample(&self) -> &[i16] {
        &self.offered
    }

    pub fn target_channels(&self) -> usize {
        self.target_channels
    }

    /// Drop resampler history and carried frames (after a flush)
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.carry.clear();
    }
}

/// `ceil(mic_frames * ref_rate / mic_rate)`
fn input_frames_for(mic_frames: usize, ref_rate: u32, mic_rate: u32) -> usize {
    let num = mic_frames as u64 * ref_rate as u64;
    num.div_ceil(mic_rate as u64) as usize
}
