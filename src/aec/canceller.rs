//! Echo cancellation algorithms
//!
//! The pipeline treats the canceller as a black box behind
//! [`EchoCanceller`]. Implementations are looked up in a static table by
//! [`CancellerKind`]; callers can also hand in their own boxed canceller.
//! Releasing a canceller is dropping it.

use serde::{Deserialize, Serialize};

use crate::error::CancellerError;

/// Parameters every canceller is created with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CancellerParams {
    pub sample_rate: u32,
    pub reference_channels: usize,
    pub mic_channels: usize,
    pub filter_len: usize,
    pub step_size: f32,
}

/// A cancellation algorithm operating on 32-bit interleaved blocks
pub trait EchoCanceller: Send {
    /// Remove the echo of `reference` from `mic`, writing `frames` frames to
    /// `output`. Timestamps are the first-frame times of each block.
    fn process(
        &mut self,
        reference: &[i32],
        reference_time_us: u64,
        mic: &[i32],
        mic_time_us: u64,
        frames: usize,
        output: &mut [i32],
    ) -> Result<(), CancellerError>;

    /// Forget all adaptive state
    fn reset(&mut self);

    fn name(&self) -> &'static str;
}

/// Registered algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellerKind {
    /// Normalized least-mean-squares adaptive filter
    Nlms,
    /// Copies the microphone through; useful to measure pipeline overhead
    Bypass,
}

type Constructor = fn(&CancellerParams) -> Result<Box<dyn EchoCanceller>, CancellerError>;

/// Caller-supplied constructor, used instead of the registry when set
pub type CancellerFactory =
    dyn Fn(&CancellerParams) -> Result<Box<dyn EchoCanceller>, CancellerError> + Send + Sync;

static REGISTRY: &[(CancellerKind, Constructor)] = &[
    (CancellerKind::Nlms, new_nlms),
    (CancellerKind::Bypass, new_bypass),
];

fn new_nlms(params: &CancellerParams) -> Result<Box<dyn EchoCanceller>, CancellerError> {
    Ok(Box::new(NlmsCanceller::new(params)?))
}

fn new_bypass(params: &CancellerParams) -> Result<Box<dyn EchoCanceller>, CancellerError> {
    Ok(Box::new(BypassCanceller::new(params)?))
}

/// Create a registered canceller
pub fn create_canceller(
    kind: CancellerKind,
    params: &CancellerParams,
) -> Result<Box<dyn EchoCanceller>, CancellerError> {
    REGISTRY
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, ctor)| ctor(params))
        .unwrap_or_else(|| Err(CancellerError::Init(format!("{:?} is not registered", kind))))
}

fn check_params(params: &CancellerParams) -> Result<(), CancellerError> {
    if params.sample_rate == 0 || params.reference_channels == 0 || params.mic_channels == 0 {
        return Err(CancellerError::Init(format!(
            "invalid parameters: {} Hz, {} reference / {} mic channels",
            params.sample_rate, params.reference_channels, params.mic_channels
        )));
    }
    Ok(())
}

fn check_lengths(
    reference: &[i32],
    ref_channels: usize,
    mic: &[i32],
    output: &[i32],
    mic_channels: usize,
    frames: usize,
) -> Result<(), CancellerError> {
    let need_ref = frames * ref_channels;
    if reference.len() < need_ref {
        return Err(CancellerError::FrameMismatch {
            expected: need_ref,
            actual: reference.len(),
        });
    }
    let need_mic = frames * mic_channels;
    if mic.len() < need_mic || output.len() < need_mic {
        return Err(CancellerError::FrameMismatch {
            expected: need_mic,
            actual: mic.len().min(output.len()),
        });
    }
    Ok(())
}

const FULL_SCALE: f32 = 2_147_483_648.0;

/// NLMS-based acoustic echo canceller.
///
/// One adaptive filter per microphone channel; mic channel `c` is driven by
/// reference channel `c % reference_channels`.
pub struct NlmsCanceller {
    /// Adaptive filter taps, one set per mic channel
    weights: Vec<Vec<f32>>,
    /// Reference history rings, one per reference channel
    history: Vec<Vec<f32>>,
    /// Write position in the history rings
    pos: usize,
    ref_channels: usize,
    mic_channels: usize,
    /// Step size (mu) for NLMS adaptation
    mu: f32,
    /// Regularization to prevent division by zero
    delta: f32,
}

impl NlmsCanceller {
    pub fn new(params: &CancellerParams) -> Result<Self, CancellerError> {
        check_params(params)?;
        if params.filter_len == 0 {
            return Err(CancellerError::Init("filter length must be non-zero".into()));
        }
        Ok(Self {
            weights: vec![vec![0.0; params.filter_len]; params.mic_channels],
            history: vec![vec![0.0; params.filter_len]; params.reference_channels],
            pos: 0,
            ref_channels: params.reference_channels,
            mic_channels: params.mic_channels,
            mu: params.step_size.clamp(0.01, 1.0),
            delta: 1e-6,
        })
    }

    fn filter_len(&self) -> usize {
        self.history[0].len()
    }
}

impl EchoCanceller for NlmsCanceller {
    fn process(
        &mut self,
        reference: &[i32],
        _reference_time_us: u64,
        mic: &[i32],
        _mic_time_us: u64,
        frames: usize,
        output: &mut [i32],
    ) -> Result<(), CancellerError> {
        check_lengths(reference, self.ref_channels, mic, output, self.mic_channels, frames)?;
        let len = self.filter_len();

        for frame in 0..frames {
            for (rc, ring) in self.history.iter_mut().enumerate() {
                ring[self.pos] = reference[frame * self.ref_channels + rc] as f32 / FULL_SCALE;
            }

            for c in 0..self.mic_channels {
                let ring = &self.history[c % self.ref_channels];
                let weights = &mut self.weights[c];

                // Estimated echo and reference power over the filter window
                let mut echo_est = 0.0f32;
                let mut ref_power = 0.0f32;
                for (k, w) in weights.iter().enumerate() {
                    let r = ring[(self.pos + len - k) % len];
                    echo_est += w * r;
                    ref_power += r * r;
                }

                let idx = frame * self.mic_channels + c;
                let error = mic[idx] as f32 / FULL_SCALE - echo_est;

                let step = self.mu * error / (ref_power + self.delta);
                for (k, w) in weights.iter_mut().enumerate() {
                    *w += step * ring[(self.pos + len - k) % len];
                }

                output[idx] = (error * FULL_SCALE).round().clamp(i32::MIN as f32, i32::MAX as f32) as i32;
            }

            self.pos = (self.pos + 1) % len;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.weights.iter_mut().for_each(|w| w.fill(0.0));
        self.history.iter_mut().for_each(|h| h.fill(0.0));
        self.pos = 0;
    }

    fn name(&self) -> &'static str {
        "nlms"
    }
}

/// Copies the microphone to the output unchanged
pub struct BypassCanceller {
    ref_channels: usize,
    mic_channels: usize,
}

impl BypassCanceller {
    pub fn new(params: &CancellerParams) -> Result<Self, CancellerError> {
        check_params(params)?;
        Ok(Self {
            ref_channels: params.reference_channels,
            mic_channels: params.mic_channels,
        })
    }
}

impl EchoCanceller for BypassCanceller {
    fn process(
        &mut self,
        reference: &[i32],
        _reference_time_us: u64,
        mic: &[i32],
        _mic_time_us: u64,
        frames: usize,
        output: &mut [i32],
    ) -> Result<(), CancellerError> {
        check_lengths(reference, self.ref_channels, mic, output, self.mic_channels, frames)?;
        let n = frames * self.mic_channels;
        output[..n].copy_from_slice(&mic[..n]);
        Ok(())
    }

    fn reset(&mut self) {}

    fn name(&self) -> &'static str {
        "bypass"
    }
}
