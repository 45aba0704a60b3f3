//! AEC Simulation
//!
//! Runs a synthetic playback thread and capture loop through the echo
//! canceller in real time and prints the resulting statistics.
//!
//! ```text
//! aec-sim [seconds] [config.toml]
//! ```

use anyhow::{Context, Result};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aec_sync::{
    audio::format::{write_i16_samples, SampleFormat, StreamFormat},
    constants::*,
    error::PipelineError,
    AecConfig, AecContext, EndpointConfig, Error,
};

const BLOCK_MS: u64 = 10;
const ECHO_GAIN: f32 = 0.4;

/// Loudspeaker test signal: two tones, amplitude in 16-bit units
fn speaker_sample(t: f32) -> f32 {
    (TAU * 440.0 * t).sin() * 9_000.0 + (TAU * 1_250.0 * t).sin() * 4_000.0
}

fn energy(samples: &[i16]) -> f64 {
    samples.iter().map(|&s| (s as f64).powi(2)).sum()
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let seconds: u64 = match args.next() {
        Some(arg) => arg.parse().context("duration must be a whole number of seconds")?,
        None => 3,
    };
    let config = match args.next() {
        Some(path) => AecConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => AecConfig::load_or_default()?,
    };

    tracing::info!("Starting AEC simulation for {} s", seconds);

    let reference_format = StreamFormat::new(PLAYBACK_SAMPLE_RATE, 2, SampleFormat::S16Le);
    let mic_format = StreamFormat::new(CAPTURE_SAMPLE_RATE, 1, SampleFormat::S16Le);

    let ctx = Arc::new(AecContext::new(config)?);
    ctx.configure_reference(EndpointConfig::new(reference_format))?;
    ctx.configure_microphone(EndpointConfig::new(mic_format))?;
    ctx.set_reference_running(true);

    let stop = Arc::new(AtomicBool::new(false));

    // Playback: one 10 ms stereo block per tick
    let playback = {
        let ctx = ctx.clone();
        let stop = stop.clone();
        thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let frames = (PLAYBACK_SAMPLE_RATE as u64 * BLOCK_MS / 1000) as usize;
                let mut samples = vec![0i16; frames * 2];
                let mut bytes = vec![0u8; frames * 4];
                let mut n = 0u64;
                let start = Instant::now();
                let mut tick = 0u32;

                while !stop.load(Ordering::Relaxed) {
                    for frame in samples.chunks_exact_mut(2) {
                        let s = speaker_sample(n as f32 / PLAYBACK_SAMPLE_RATE as f32) as i16;
                        frame.fill(s);
                        n += 1;
                    }
                    write_i16_samples(&samples, &mut bytes);
                    if let Err(e) = ctx.write_reference_block(&bytes) {
                        tracing::warn!("Reference write failed: {}", e);
                    }

                    tick += 1;
                    let next = start + Duration::from_millis(BLOCK_MS) * tick;
                    thread::sleep(next.saturating_duration_since(Instant::now()));
                }
            })?
    };

    // Capture: the echo of the same signal plus a little near-end noise
    let frames = (CAPTURE_SAMPLE_RATE as u64 * BLOCK_MS / 1000) as usize;
    let mut mic = vec![0i16; frames];
    let mut block = vec![0u8; frames * 2];
    let mut cancelled = vec![0i16; frames];
    let mut n = 0u64;
    let mut energy_in = 0.0;
    let mut energy_out = 0.0;
    let mut underruns = 0u32;
    let blocks = seconds * 1000 / BLOCK_MS;
    let start = Instant::now();

    for i in 0..blocks {
        for s in mic.iter_mut() {
            let t = n as f32 / CAPTURE_SAMPLE_RATE as f32;
            let noise = ((n.wrapping_mul(2_654_435_761) >> 16) % 200) as f32 - 100.0;
            *s = (speaker_sample(t) * ECHO_GAIN + noise) as i16;
            n += 1;
        }
        write_i16_samples(&mic, &mut block);

        match ctx.process_capture_block(&mut block) {
            Ok(()) => {}
            Err(Error::Pipeline(PipelineError::Underrun { .. })) => underruns += 1,
            Err(e) => return Err(e.into()),
        }

        // Skip the first second while the filter converges
        if i >= 1000 / BLOCK_MS {
            for (out, chunk) in cancelled.iter_mut().zip(block.chunks_exact(2)) {
                *out = i16::from_le_bytes([chunk[0], chunk[1]]);
            }
            energy_in += energy(&mic);
            energy_out += energy(&cancelled);
        }

        let next = start + Duration::from_millis(BLOCK_MS) * (i as u32 + 1);
        thread::sleep(next.saturating_duration_since(Instant::now()));
    }

    stop.store(true, Ordering::Relaxed);
    if playback.join().is_err() {
        tracing::error!("Playback thread panicked");
    }
    ctx.teardown_microphone();
    ctx.teardown_reference();

    if energy_out > 0.0 {
        println!("Echo return loss enhancement: {:.1} dB", 10.0 * (energy_in / energy_out).log10());
    }
    println!("Capture underruns: {}", underruns);
    println!("{}", serde_json::to_string_pretty(&ctx.stats())?);
    Ok(())
}
