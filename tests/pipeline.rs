//! End-to-end tests through the public context, worker thread included

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aec_sync::aec::canceller::{CancellerParams, EchoCanceller};
use aec_sync::audio::format::{read_i16_samples, write_i16_samples, SampleFormat, StreamFormat};
use aec_sync::error::{CancellerError, PipelineError};
use aec_sync::sync::ManualClock;
use aec_sync::{AecConfig, AecContext, EndpointConfig, Error};

const QUANTUM: usize = 160;

/// Records calls and writes silence, so cancelled output is recognizable.
/// A failing mock scribbles over the output before reporting an error.
struct MockCanceller {
    calls: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl EchoCanceller for MockCanceller {
    fn process(
        &mut self,
        _reference: &[i32],
        _reference_time_us: u64,
        _mic: &[i32],
        _mic_time_us: u64,
        frames: usize,
        output: &mut [i32],
    ) -> Result<(), CancellerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if self.fail {
            output[..frames].fill(0x5A5A_5A5A);
            return Err(CancellerError::Process(-1));
        }
        output[..frames].fill(0);
        Ok(())
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct Harness {
    ctx: Arc<AecContext>,
    clock: ManualClock,
    calls: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
}

impl Harness {
    fn new(worker_timeout_ms: u64, delay: Duration) -> Self {
        Self::with_mock(worker_timeout_ms, delay, false)
    }

    fn with_mock(worker_timeout_ms: u64, delay: Duration, fail: bool) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let resets = Arc::new(AtomicUsize::new(0));
        let (c, r) = (calls.clone(), resets.clone());
        let config = AecConfig {
            quantum_frames: QUANTUM,
            worker_timeout_ms,
            ..Default::default()
        };
        let ctx = AecContext::new(config)
            .unwrap()
            .with_canceller_factory(Arc::new(
                move |_: &CancellerParams| -> Result<Box<dyn EchoCanceller>, CancellerError> {
                    Ok(Box::new(MockCanceller {
                        calls: c.clone(),
                        resets: r.clone(),
                        delay,
                        fail,
                    }))
                },
            ));

        let clock = ManualClock::new(10_000_000);
        let format = StreamFormat::new(16_000, 1, SampleFormat::S16Le);
        ctx.configure_reference(EndpointConfig::new(format).with_clock(Arc::new(clock.clone())))
            .unwrap();
        ctx.configure_microphone(EndpointConfig::new(format).with_clock(Arc::new(clock.clone())))
            .unwrap();
        Self {
            ctx: Arc::new(ctx),
            clock,
            calls,
            resets,
        }
    }

    /// Start the reference and push the first block, which triggers the
    /// flush and finds no reference yet.
    fn start(&self) {
        self.ctx.set_reference_running(true);
        let mut first = mic_block(QUANTUM, 1);
        if let Err(e) = self.ctx.process_capture_block(&mut first) {
            assert!(matches!(e, Error::Pipeline(PipelineError::Underrun { .. })));
        }
    }
}

fn mic_block(frames: usize, seed: i16) -> Vec<u8> {
    let samples: Vec<i16> = (0..frames)
        .map(|i| seed.wrapping_mul(31).wrapping_add(i as i16 * 7))
        .collect();
    let mut bytes = vec![0u8; frames * 2];
    write_i16_samples(&samples, &mut bytes);
    bytes
}

#[test]
fn test_synchronized_blocks_are_cancelled() {
    let h = Harness::new(2_000, Duration::ZERO);
    h.start();

    for i in 0..5 {
        h.ctx.write_reference_block(&mic_block(QUANTUM, 100 + i)).unwrap();
        h.clock.advance_usec(2_000);
        let mut block = mic_block(QUANTUM, i);
        h.ctx.process_capture_block(&mut block).unwrap();
        assert!(block.iter().all(|&b| b == 0), "block {} was not cancelled", i);
        h.clock.advance_usec(8_000);
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 5);
    assert_eq!(h.ctx.stats().quanta_cancelled, 5);
}

#[test]
fn test_divergence_passes_mic_through_and_resets() {
    let h = Harness::new(2_000, Duration::ZERO);
    h.start();

    h.ctx.write_reference_block(&mic_block(QUANTUM, 50)).unwrap();
    h.clock.advance_usec(200_001);
    let raw = mic_block(QUANTUM, 9);
    let mut block = raw.clone();
    let resets_before = h.resets.load(Ordering::SeqCst);

    h.ctx.process_capture_block(&mut block).unwrap();

    assert_eq!(block, raw);
    assert!(h.resets.load(Ordering::SeqCst) > resets_before);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.ctx.stats().divergences, 1);
    assert_eq!(h.ctx.queue_levels().reference_audio, 0);
}

#[test]
fn test_drift_at_tolerance_still_cancels() {
    let h = Harness::new(2_000, Duration::ZERO);
    h.start();

    h.ctx.write_reference_block(&mic_block(QUANTUM, 50)).unwrap();
    h.clock.advance_usec(200_000);
    let mut block = mic_block(QUANTUM, 9);
    h.ctx.process_capture_block(&mut block).unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reference_not_running_is_passthrough() {
    let h = Harness::new(2_000, Duration::ZERO);
    h.ctx.write_reference_block(&mic_block(QUANTUM, 3)).unwrap();

    let raw = mic_block(QUANTUM, 4);
    let mut block = raw.clone();
    h.ctx.process_capture_block(&mut block).unwrap();

    assert_eq!(block, raw);
    assert_eq!(h.ctx.queue_levels().mic_audio, 0);
    assert_eq!(h.ctx.stats().quanta_processed, 0);
}

#[test]
fn test_restart_flushes_all_four_queues() {
    let h = Harness::new(2_000, Duration::ZERO);
    h.ctx.set_reference_running(true);

    // Half a quantum: queued, not processed
    let mut half = mic_block(QUANTUM / 2, 1);
    h.ctx.process_capture_block(&mut half).unwrap();
    h.ctx.set_reference_running(false);
    let mut stopped = mic_block(QUANTUM / 2, 5);
    h.ctx.process_capture_block(&mut stopped).unwrap();
    h.ctx.write_reference_block(&mic_block(QUANTUM, 2)).unwrap();
    h.ctx.write_reference_block(&mic_block(QUANTUM, 3)).unwrap();

    let before = h.ctx.queue_levels();
    assert_eq!(before.mic_audio, QUANTUM);
    assert_eq!(before.mic_timestamps, 1);
    assert_eq!(before.reference_audio, QUANTUM * 4);
    assert_eq!(before.reference_timestamps, 2);

    let resets_before = h.resets.load(Ordering::SeqCst);
    h.ctx.set_reference_running(true);
    let mut half = mic_block(QUANTUM / 2, 4);
    h.ctx.process_capture_block(&mut half).unwrap();

    // Only the block written after the flush is left
    let after = h.ctx.queue_levels();
    assert_eq!(after.reference_audio, 0);
    assert_eq!(after.reference_timestamps, 0);
    assert_eq!(after.mic_audio, QUANTUM);
    assert_eq!(after.mic_timestamps, 1);
    assert!(h.resets.load(Ordering::SeqCst) > resets_before);
}

#[test]
fn test_underrun_leaves_raw_mic_in_buffer() {
    let h = Harness::new(5, Duration::from_millis(200));
    h.start();

    h.ctx.write_reference_block(&mic_block(QUANTUM, 8)).unwrap();
    h.clock.advance_usec(1_000);
    let raw = mic_block(QUANTUM, 6);
    let mut block = raw.clone();

    let err = h.ctx.process_capture_block(&mut block).unwrap_err();
    assert!(matches!(
        err,
        Error::Pipeline(PipelineError::Underrun {
            available: 0,
            requested: 320
        })
    ));
    assert_eq!(block, raw);
    assert!(h.ctx.stats().underruns >= 1);
}

#[test]
fn test_canceller_failure_passes_raw_mic_and_resets() {
    let h = Harness::with_mock(2_000, Duration::ZERO, true);
    h.start();

    h.ctx.write_reference_block(&mic_block(QUANTUM, 40)).unwrap();
    h.ctx.write_reference_block(&mic_block(QUANTUM, 41)).unwrap();
    h.clock.advance_usec(1_000);
    let raw = mic_block(QUANTUM, 12);
    let mut block = raw.clone();
    let resets_before = h.resets.load(Ordering::SeqCst);

    h.ctx.process_capture_block(&mut block).unwrap();

    assert_eq!(block, raw);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert!(h.resets.load(Ordering::SeqCst) > resets_before);
    let stats = h.ctx.stats();
    assert_eq!(stats.canceller_failures, 1);
    assert_eq!(stats.quanta_cancelled, 0);
    assert_eq!(h.ctx.queue_levels().reference_audio, 0);
}

#[test]
fn test_playback_path_does_not_wait_for_worker() {
    let h = Harness::new(2_000, Duration::from_millis(300));
    h.start();

    h.ctx.write_reference_block(&mic_block(QUANTUM, 2)).unwrap();
    h.clock.advance_usec(1_000);
    let capture = {
        let ctx = h.ctx.clone();
        thread::spawn(move || {
            let mut block = mic_block(QUANTUM, 3);
            ctx.process_capture_block(&mut block)
        })
    };

    // Let the worker get into the canceller
    let started = Instant::now();
    while h.calls.load(Ordering::SeqCst) == 0 && started.elapsed() < Duration::from_secs(2) {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    let t0 = Instant::now();
    h.ctx.write_reference_block(&mic_block(QUANTUM, 4)).unwrap();
    h.ctx.set_reference_running(true);
    let blocked = t0.elapsed();
    assert!(blocked < Duration::from_millis(50), "playback path blocked for {:?}", blocked);

    capture.join().unwrap().unwrap();
    assert_eq!(h.ctx.stats().quanta_cancelled, 1);
}

#[test]
fn test_teardown_and_reconfigure() {
    let h = Harness::new(2_000, Duration::ZERO);
    h.start();
    h.ctx.teardown_microphone();
    assert!(!h.ctx.is_microphone_configured());

    let mut block = mic_block(QUANTUM, 1);
    assert!(matches!(
        h.ctx.process_capture_block(&mut block),
        Err(Error::Pipeline(PipelineError::NotConfigured(_)))
    ));

    let format = StreamFormat::new(16_000, 1, SampleFormat::S16Le);
    h.ctx
        .configure_microphone(EndpointConfig::new(format).with_clock(Arc::new(h.clock.clone())))
        .unwrap();
    h.ctx.process_capture_block(&mut block).unwrap();
}

/// Real NLMS canceller fed a 48 kHz stereo reference and a 16 kHz echo
#[test]
fn test_nlms_removes_resampled_echo() {
    let config = AecConfig {
        quantum_frames: QUANTUM,
        nlms_filter_len: 16,
        worker_timeout_ms: 2_000,
        ..Default::default()
    };
    let ctx = AecContext::new(config).unwrap();
    let clock = ManualClock::new(1_000_000);
    let reference = StreamFormat::new(48_000, 2, SampleFormat::S16Le);
    let mic = StreamFormat::new(16_000, 1, SampleFormat::S16Le);
    ctx.configure_reference(EndpointConfig::new(reference).with_clock(Arc::new(clock.clone())))
        .unwrap();
    ctx.configure_microphone(EndpointConfig::new(mic).with_clock(Arc::new(clock.clone())))
        .unwrap();
    ctx.set_reference_running(true);

    let speaker = |n: usize| {
        let t = n as f32;
        ((t * 0.021).sin() * 9_000.0 + (t * 0.063).sin() * 4_000.0) as i16
    };

    let mut warmup = vec![0u8; QUANTUM * 2];
    ctx.process_capture_block(&mut warmup).unwrap();

    let mut energy_in = 0.0f64;
    let mut energy_out = 0.0f64;
    for block in 0..80 {
        let stereo: Vec<i16> = (0..QUANTUM * 3)
            .flat_map(|i| {
                let s = speaker(block * QUANTUM * 3 + i);
                [s, s]
            })
            .collect();
        let mut bytes = vec![0u8; stereo.len() * 2];
        write_i16_samples(&stereo, &mut bytes);
        ctx.write_reference_block(&bytes).unwrap();
        clock.advance_usec(1_000);

        let echo: Vec<i16> = (0..QUANTUM)
            .map(|k| speaker(block * QUANTUM * 3 + k * 3) / 2)
            .collect();
        let mut capture = vec![0u8; QUANTUM * 2];
        write_i16_samples(&echo, &mut capture);
        ctx.process_capture_block(&mut capture).unwrap();
        clock.advance_usec(9_000);

        if block >= 70 {
            let mut out = vec![0i16; QUANTUM];
            read_i16_samples(&capture, &mut out);
            energy_in += echo.iter().map(|&s| (s as f64).powi(2)).sum::<f64>();
            energy_out += out.iter().map(|&s| (s as f64).powi(2)).sum::<f64>();
        }
    }

    let stats = ctx.stats();
    assert_eq!(stats.divergences, 0);
    assert!(stats.quanta_cancelled >= 80);
    assert!(
        energy_out < energy_in * 0.05,
        "residual {} vs echo {}",
        energy_out,
        energy_in
    );
}
