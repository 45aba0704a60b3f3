//! Sample rate conversion for the echo reference
//!
//! All resamplers work on interleaved 16-bit frames and take their frame
//! counts by reference: on entry `in_frames` is what is offered and
//! `out_frames` is the output capacity; on return they hold what was
//! consumed and produced. A resampler may consume fewer frames than offered.

use serde::{Deserialize, Serialize};

use crate::error::ResamplerError;

/// Interleaved 16-bit sample rate converter
pub trait Resampler: Send {
    fn resample(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> Result<(), ResamplerError>;

    /// Drop any filter history
    fn reset(&mut self);
}

/// Available resampler implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplerKind {
    /// Two-tap linear interpolation with history across calls
    Linear,
    /// FFT-based converter (rubato)
    Fft,
}

/// Build a resampler for `channels`-channel audio. Equal rates give a copy.
///
/// `chunk_in_frames` is the number of input frames offered per call; the FFT
/// converter is sized for it.
pub fn create_resampler(
    kind: ResamplerKind,
    in_rate: u32,
    out_rate: u32,
    channels: usize,
    chunk_in_frames: usize,
) -> Result<Box<dyn Resampler>, ResamplerError> {
    if in_rate == 0 || out_rate == 0 || channels == 0 {
        return Err(ResamplerError::Init(format!(
            "invalid conversion {} Hz -> {} Hz, {} channels",
            in_rate, out_rate, channels
        )));
    }
    if in_rate == out_rate {
        return Ok(Box::new(Passthrough { channels }));
    }

    match kind {
        ResamplerKind::Linear => Ok(Box::new(LinearResampler::new(in_rate, out_rate, channels))),
        #[cfg(feature = "fft-resampler")]
        ResamplerKind::Fft => Ok(Box::new(FftResampler::new(
            in_rate,
            out_rate,
            channels,
            chunk_in_frames,
        )?)),
        #[cfg(not(feature = "fft-resampler"))]
        ResamplerKind::Fft => {
            let _ = chunk_in_frames;
            Err(ResamplerError::Init(
                "built without the fft-resampler feature".into(),
            ))
        }
    }
}

/// Same-rate "conversion"
pub struct Passthrough {
    channels: usize,
}

impl Resampler for Passthrough {
    fn resample(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> Result<(), ResamplerError> {
        let frames = (*in_frames)
            .min(*out_frames)
            .min(input.len() / self.channels)
            .min(output.len() / self.channels);
        let samples = frames * self.channels;
        output[..samples].copy_from_slice(&input[..samples]);
        *in_frames = frames;
        *out_frames = frames;
        Ok(())
    }

    fn reset(&mut self) {}
}

/// Linear interpolating resampler
///
/// Keeps the last consumed frame so interpolation is continuous across
/// calls.
pub struct LinearResampler {
    step: f64,
    channels: usize,
    /// Read position, in input frames, relative to the start of the next call.
    /// -1.0 .. 0.0 interpolates from the previous call's last frame.
    pos: f64,
    history: Vec<i16>,
}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32, channels: usize) -> Self {
        Self {
            step: in_rate as f64 / out_rate as f64,
            channels,
            pos: 0.0,
            history: vec![0; channels],
        }
    }
}

impl Resampler for LinearResampler {
    fn resample(
        &mut self,
        input: &[i16],
        in_frames: &mut usize,
        output: &mut [i16],
        out_frames: &mut usize,
    ) -> Result<(), ResamplerError> {
        let ch = self.channels;
        let available = (*in_frames).min(input.len() / ch) as isize;
        let capacity = (*out_frames).min(output.len() / ch);
        let mut produced = 0;

        while produced < capacity {
            let idx = self.pos.floor() as isize;
            if idx + 1 >= available {
                break;
            }
            let frac = self.pos - idx as f64;
            for c in 0..ch {
                let s0 = if idx < 0 {
                    self.history[c]
                } else {
                    input[idx as usize * ch + c]
                } as f64;
                let s1 = input[(idx + 1) as usize * ch + c] as f64;
                let value = s0 + (s1 - s0) * frac;
                output[produced * ch + c] = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            }
            produced += 1;
            self.pos += self.step;
        }

        // Frames before floor(pos) are done with; frame floor(pos) is kept
        // as history so the next call can interpolate from it.
        let needed_from = self.pos.floor() as isize + 1;
        let consumed = needed_from.clamp(0, available.max(0)) as usize;
        if consumed > 0 {
            let last = (consumed - 1) * ch;
            self.history.copy_from_slice(&input[last..last + ch]);
        }
        self.pos -= consumed as f64;

        *in_frames = consumed;
        *out_frames = produced;
        Ok(())
    }

    fn reset(&mut self) {
        self.pos = 0.0;
        self.history.iter_mut().for_each(|s| *s = 0);
    }
}

#[cfg(feature = "fft-resampler")]
pub use fft::FftResampler;

#[cfg(feature = "fft-resampler")]
mod fft {
    use rubato::{FftFixedIn, Resampler as RubatoResampler};

    use super::Resampler;
    use crate::error::ResamplerError;

    /// Fixed-input FFT resampler backed by rubato
    pub struct FftResampler {
        inner: FftFixedIn<f32>,
        channels: usize,
        in_planar: Vec<Vec<f32>>,
        out_planar: Vec<Vec<f32>>,
    }

    impl FftResampler {
        pub fn new(
            in_rate: u32,
            out_rate: u32,
            channels: usize,
            chunk_in_frames: usize,
        ) -> Result<Self, ResamplerError> {
            let inner = FftFixedIn::<f32>::new(
                in_rate as usize,
                out_rate as usize,
                chunk_in_frames.max(1),
                2,
                channels,
            )
            .map_err(|e| ResamplerError::Init(e.to_string()))?;

            let out_max = inner.output_frames_max();
            Ok(Self {
                inner,
                channels,
                in_planar: vec![Vec::with_capacity(chunk_in_frames); channels],
                out_planar: vec![vec![0.0; out_max]; channels],
            })
        }
    }

    impl Resampler for FftResampler {
        fn resample(
            &mut self,
            input: &[i16],
            in_frames: &mut usize,
            output: &mut [i16],
            out_frames: &mut usize,
        ) -> Result<(), ResamplerError> {
            let ch = self.channels;
            let offered = (*in_frames).min(input.len() / ch);
            let capacity = (*out_frames).min(output.len() / ch);
            let mut consumed = 0;
            let mut produced = 0;

            loop {
                let need = self.inner.input_frames_next();
                let will = self.inner.output_frames_next();
                if offered - consumed < need || capacity - produced < will {
                    break;
                }

                for (c, plane) in self.in_planar.iter_mut().enumerate() {
                    plane.clear();
                    plane.extend(
                        (0..need).map(|f| input[(consumed + f) * ch + c] as f32 / 32768.0),
                    );
                }

                let (n_in, n_out) = self
                    .inner
                    .process_into_buffer(&self.in_planar, &mut self.out_planar, None)
                    .map_err(|e| ResamplerError::Process(e.to_string()))?;

                for f in 0..n_out {
                    for (c, plane) in self.out_planar.iter().enumerate() {
                        let value = (plane[f] * 32768.0).round().clamp(-32768.0, 32767.0);
                        output[(produced + f) * ch + c] = value as i16;
                    }
                }
                consumed += n_in;
                produced += n_out;
            }

            *in_frames = consumed;
            *out_frames = produced;
            Ok(())
        }

        fn reset(&mut self) {
            self.inner.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_rates_copy() {
        let mut r = create_resampler(ResamplerKind::Linear, 16_000, 16_000, 1, 160).unwrap();
        let input: Vec<i16> = (0..160).map(|i| (i * 100) as i16).collect();
        let mut output = vec![0i16; 160];
        let (mut n_in, mut n_out) = (160, 160);
        r.resample(&input, &mut n_in, &mut output, &mut n_out).unwrap();
        assert_eq!((n_in, n_out), (160, 160));
        assert_eq!(output, input);
    }

    #[test]
    fn test_linear_decimation_by_three() {
        let mut r = LinearResampler::new(48_000, 16_000, 1);
        let input: Vec<i16> = (0..480).map(|i| i as i16).collect();
        let mut output = vec![0i16; 160];
        let (mut n_in, mut n_out) = (480, 160);
        r.resample(&input, &mut n_in, &mut output, &mut n_out).unwrap();

        assert_eq!(n_out, 160);
        assert_eq!(n_in, 480);
        assert_eq!(output[0], 0);
        assert_eq!(output[1], 3);
        assert_eq!(output[159], 477);
    }

    #[test]
    fn test_linear_consumes_less_when_output_is_full() {
        let mut r = LinearResampler::new(48_000, 16_000, 2);
        let input = vec![0i16; 480 * 2];
        let mut output = vec![0i16; 50 * 2];
        let (mut n_in, mut n_out) = (480, 50);
        r.resample(&input, &mut n_in, &mut output, &mut n_out).unwrap();
        assert_eq!(n_out, 50);
        // Frame 150 is the next interpolation start and is carried as history
        assert_eq!(n_in, 151);
    }

    #[test]
    fn test_linear_is_continuous_across_calls() {
        let mut r = LinearResampler::new(2, 3, 1);
        let input: Vec<i16> = (0..30).map(|i| i * 30).collect();
        let mut whole = vec![0i16; 64];
        let (mut n_in, mut n_out) = (30, 64);
        r.resample(&input, &mut n_in, &mut whole, &mut n_out).unwrap();
        let whole = whole[..n_out].to_vec();

        r.reset();
        let mut split = Vec::new();
        for chunk in input.chunks(10) {
            let mut out = vec![0i16; 32];
            let (mut n_in, mut n_out) = (chunk.len(), 32);
            r.resample(chunk, &mut n_in, &mut out, &mut n_out).unwrap();
            assert_eq!(n_in, chunk.len());
            split.extend_from_slice(&out[..n_out]);
        }
        assert_eq!(&split[..whole.len().min(split.len())], &whole[..whole.len().min(split.len())]);
    }

    #[test]
    fn test_invalid_rates_rejected() {
        assert!(create_resampler(ResamplerKind::Linear, 0, 16_000, 1, 160).is_err());
    }

    #[cfg(feature = "fft-resampler")]
    #[test]
    fn test_fft_produces_requested_block() {
        let mut r = create_resampler(ResamplerKind::Fft, 48_000, 16_000, 1, 480).unwrap();
        let input = vec![0i16; 480];
        let mut output = vec![1i16; 160];
        let (mut n_in, mut n_out) = (480, 160);
        r.resample(&input, &mut n_in, &mut output, &mut n_out).unwrap();
        assert_eq!(n_in, 480);
        assert_eq!(n_out, 160);
        assert!(output.iter().all(|&s| s == 0));
    }
}
