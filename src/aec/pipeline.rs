//! Per-quantum cancellation step and the state it shares with the context
//!
//! [`SharedPipeline`] only holds what the capture, playback and worker
//! threads must agree on: the running flag and the current echo reference
//! handle. Its lock guards those scalars and is never held across FIFO
//! traffic. Everything a quantum touches lives in a [`CapturePipeline`]
//! that the worker thread owns outright.

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::aec::canceller::{CancellerParams, EchoCanceller};
use crate::aec::dump::DebugDump;
use crate::aec::endpoint::{EndpointConfig, EndpointProducer, StreamEndpoint};
use crate::aec::stats::AecStats;
use crate::audio::buffer::{create_shared_fifo, SharedByteFifo};
use crate::audio::conditioner::ReferenceConditioner;
use crate::audio::format::{read_i32_samples, write_i32_samples, StreamFormat};
use crate::config::AecConfig;
use crate::error::{CancellerError, Error, PipelineError, Result};
use crate::sync::gate::{Divergence, RunningState, SyncGate};

/// Why a quantum went out uncancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Reference stopped or not configured
    ReferenceStopped,
    /// Reference FIFO was empty
    NoReferenceData,
    /// Conditioning the reference failed
    ReferenceError,
    Diverged(Divergence),
    CancellerFailed,
}

impl PassthroughReason {
    /// Whether the pipeline must be resynchronized afterwards
    pub fn requires_resync(self) -> bool {
        !matches!(self, PassthroughReason::ReferenceStopped)
    }
}

/// What the worker did with one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantumOutcome {
    Cancelled,
    Passthrough(PassthroughReason),
    /// Less than a quantum was queued (e.g. after a flush)
    Skipped,
    /// All queues were emptied on request
    Flushed,
}

/// The echo reference as published to the worker
#[derive(Clone)]
pub struct ReferenceSlot {
    /// Bumped on every configure so the worker notices a replacement
    pub generation: u64,
    pub producer: EndpointProducer,
}

#[derive(Default)]
pub struct PipelineState {
    pub running: RunningState,
    pub reference: Option<ReferenceSlot>,
    /// Format of the configured microphone, if any
    pub mic_format: Option<StreamFormat>,
    generation: u64,
}

impl PipelineState {
    /// Publish a new reference, returning the one it replaces
    pub fn install_reference(&mut self, producer: EndpointProducer) -> Option<ReferenceSlot> {
        self.generation += 1;
        self.reference.replace(ReferenceSlot {
            generation: self.generation,
            producer,
        })
    }
}

/// What the worker reads under the lock before each job
pub struct Snapshot {
    pub running: bool,
    pub reference: Option<ReferenceSlot>,
}

/// State shared by the public context and the worker thread
#[derive(Default)]
pub struct SharedPipeline {
    pub state: Mutex<PipelineState>,
    pub stats: AecStats,
}

impl SharedPipeline {
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            running: state.running.is_running(),
            reference: state.reference.clone(),
        }
    }
}

/// Conditioner turning `reference` audio into mic-quantum reference blocks
pub fn build_conditioner(
    config: &AecConfig,
    reference: StreamFormat,
    mic: &StreamFormat,
) -> Result<ReferenceConditioner> {
    ReferenceConditioner::new(
        reference,
        mic.sample_rate,
        config.quantum_frames,
        config.reference_channels,
        config.downmix,
        config.resampler,
    )
}

/// Reference consumer held by the worker
struct ActiveReference {
    generation: u64,
    endpoint: StreamEndpoint,
    conditioner: Option<ReferenceConditioner>,
}

/// Microphone side of the pipeline: input queues, reference consumer,
/// canceller and output. Owned by the worker thread.
pub struct CapturePipeline {
    config: AecConfig,
    mic: StreamEndpoint,
    output: SharedByteFifo,
    quantum_frames: usize,
    canceller: Box<dyn EchoCanceller>,
    reference: Option<ActiveReference>,
    gate: SyncGate,
    dump: Option<DebugDump>,
    mic_bytes: Vec<u8>,
    mic_samples: Vec<i32>,
    out_samples: Vec<i32>,
    out_bytes: Vec<u8>,
}

impl CapturePipeline {
    /// Allocate everything the capture side needs. Nothing is kept if any
    /// step fails.
    pub fn new<F>(config: &AecConfig, mic: EndpointConfig, make_canceller: F) -> Result<Self>
    where
        F: FnOnce(&CancellerParams) -> std::result::Result<Box<dyn EchoCanceller>, CancellerError>,
    {
        let format: StreamFormat = mic.format;
        let quantum_frames = config.quantum_frames;
        let quantum_bytes = format.bytes_for_frames(quantum_frames);
        if quantum_bytes == 0 {
            return Err(Error::Config(format!("unusable microphone format {:?}", format)));
        }

        let canceller = make_canceller(&CancellerParams {
            sample_rate: format.sample_rate,
            reference_channels: config.reference_channels as usize,
            mic_channels: format.channels as usize,
            filter_len: config.nlms_filter_len,
            step_size: config.nlms_step_size,
        })?;
        debug!("Created {} canceller", canceller.name());

        let mic = StreamEndpoint::new(
            "mic",
            mic,
            quantum_bytes * config.mic_fifo_quanta,
            config.timestamp_fifo_records,
        )?;
        let output = create_shared_fifo(quantum_bytes * config.output_fifo_quanta)?;
        let dump = config
            .debug_dump_dir
            .as_ref()
            .map(DebugDump::create)
            .transpose()?;

        let samples = quantum_frames * format.channels as usize;
        Ok(Self {
            config: config.clone(),
            mic,
            output,
            quantum_frames,
            canceller,
            reference: None,
            gate: SyncGate::new(config.max_timestamp_diff_us),
            dump,
            mic_bytes: vec![0; quantum_bytes],
            mic_samples: vec![0; samples],
            out_samples: vec![0; samples],
            out_bytes: vec![0; quantum_bytes],
        })
    }

    /// Handle for the capture thread to queue mic blocks
    pub fn mic_producer(&self) -> EndpointProducer {
        self.mic.producer()
    }

    pub fn output(&self) -> SharedByteFifo {
        self.output.clone()
    }

    pub fn quantum_bytes(&self) -> usize {
        self.mic_bytes.len()
    }

    /// Follow the published reference: adopt a new or replaced one, drop
    /// one that was torn down.
    ///
    /// A newly adopted reference starts from an empty queue, since its
    /// ledger cannot be reconstructed mid-stream.
    pub fn sync_reference(&mut self, slot: Option<&ReferenceSlot>) {
        let slot = match (slot, self.reference.as_ref()) {
            (None, None) => return,
            (None, Some(_)) => {
                debug!("Echo reference gone, worker released its consumer");
                self.reference = None;
                return;
            }
            (Some(slot), Some(active)) if active.generation == slot.generation => return,
            (Some(slot), _) => slot,
        };

        let mut endpoint = slot.producer.consumer();
        endpoint.flush();
        let conditioner = match build_conditioner(&self.config, *endpoint.format(), self.mic.format()) {
            Ok(conditioner) => {
                debug!(
                    "Reference conditioner: {} reference frames per {}-frame quantum",
                    conditioner.input_frames(),
                    self.quantum_frames
                );
                Some(conditioner)
            }
            Err(e) => {
                error!("Cannot condition echo reference: {}", e);
                None
            }
        };
        self.canceller.reset();
        self.reference = Some(ActiveReference {
            generation: slot.generation,
            endpoint,
            conditioner,
        });
    }

    /// Drop all queued audio and timestamps in both directions, plus any
    /// pending output, and reset the adaptive state.
    pub fn flush_all(&mut self) {
        if let Some(active) = self.reference.as_mut() {
            active.endpoint.flush();
        }
        self.mic.flush();
        self.output.flush();
        self.reset_adaptive_state();
    }

    fn reset_adaptive_state(&mut self) {
        self.canceller.reset();
        if let Some(conditioner) = self.reference.as_mut().and_then(|r| r.conditioner.as_mut()) {
            conditioner.reset();
        }
    }

    /// Process one microphone quantum: the worker's unit of work
    pub fn process_quantum(&mut self, running: bool, stats: &AecStats) -> QuantumOutcome {
        let quantum_bytes = self.quantum_bytes();
        let queued = self.mic.available_to_read();
        if queued < quantum_bytes {
            trace!("Mic FIFO holds {} of {} bytes, skipping", queued, quantum_bytes);
            return QuantumOutcome::Skipped;
        }

        let (_, mic_time) = self.mic.read_block(&mut self.mic_bytes);
        let mic_format = *self.mic.format();
        read_i32_samples(&self.mic_bytes, mic_format.sample_format, &mut self.mic_samples);

        let (outcome, ref_time) = match self.reference.as_mut() {
            Some(ActiveReference {
                endpoint,
                conditioner: Some(conditioner),
                ..
            }) if running => cancel_quantum(
                conditioner,
                endpoint,
                &mut *self.canceller,
                &self.gate,
                &self.mic_samples,
                mic_time,
                self.quantum_frames,
                &mut self.out_samples,
            ),
            _ => (QuantumOutcome::Passthrough(PassthroughReason::ReferenceStopped), 0),
        };

        match outcome {
            QuantumOutcome::Cancelled => {
                write_i32_samples(&self.out_samples, mic_format.sample_format, &mut self.out_bytes);
                stats.inc_cancelled();
            }
            QuantumOutcome::Passthrough(reason) => {
                self.out_bytes.copy_from_slice(&self.mic_bytes);
                stats.inc_passthrough();
                match reason {
                    PassthroughReason::Diverged(_) => stats.inc_divergence(),
                    PassthroughReason::NoReferenceData => stats.inc_missing_reference(),
                    PassthroughReason::CancellerFailed => stats.inc_canceller_failure(),
                    _ => {}
                }
            }
            QuantumOutcome::Skipped | QuantumOutcome::Flushed => {}
        }

        let written = self.output.write(&self.out_bytes);
        if written < quantum_bytes {
            warn!("Output FIFO full, dropped {} bytes", quantum_bytes - written);
            stats.inc_short_write();
        }

        if let Some(dump) = self.dump.as_mut() {
            let reference_block = match (&outcome, self.reference.as_ref().and_then(|r| r.conditioner.as_ref())) {
                (QuantumOutcome::Passthrough(PassthroughReason::ReferenceStopped), _) | (_, None) => &[][..],
                (_, Some(conditioner)) => conditioner.reference(),
            };
            dump.record(&self.mic_bytes, &self.out_bytes, reference_block, mic_time, ref_time);
        }
        stats.inc_processed();

        if let QuantumOutcome::Passthrough(reason) = outcome {
            if reason.requires_resync() {
                self.resync();
                stats.inc_flush();
            }
        }
        outcome
    }

    /// Recover after a failed quantum. The reference is flushed; whole mic
    /// quanta still queued are forwarded to the output untouched so the
    /// output stream stays aligned with the input.
    fn resync(&mut self) {
        if let Some(active) = self.reference.as_mut() {
            active.endpoint.flush();
        }

        let quantum_bytes = self.quantum_bytes();
        let mut forwarded = 0;
        while self.mic.available_to_read() >= quantum_bytes {
            let (read, _) = self.mic.read_block(&mut self.mic_bytes);
            forwarded += self.output.write(&self.mic_bytes[..read]);
        }
        self.reset_adaptive_state();
        debug!("Resynchronized, forwarded {} raw mic bytes", forwarded);
    }
}

/// Condition the reference, gate on timestamps and run the canceller.
/// Returns the outcome plus the reference timestamp used (0 if none).
#[allow(clippy::too_many_arguments)]
fn cancel_quantum(
    conditioner: &mut ReferenceConditioner,
    reference: &mut StreamEndpoint,
    canceller: &mut dyn EchoCanceller,
    gate: &SyncGate,
    mic: &[i32],
    mic_time: u64,
    frames: usize,
    output: &mut [i32],
) -> (QuantumOutcome, u64) {
    let (queues, tracker) = reference.parts_mut();
    let ref_time = match conditioner.condition(&queues.audio, &queues.timestamps, tracker) {
        Ok(time) => time,
        Err(Error::Pipeline(PipelineError::NoReferenceData)) => {
            debug!("No echo reference for mic quantum at {} usec", mic_time);
            return (QuantumOutcome::Passthrough(PassthroughReason::NoReferenceData), 0);
        }
        Err(e) => {
            error!("Failed to condition echo reference: {}", e);
            return (QuantumOutcome::Passthrough(PassthroughReason::ReferenceError), 0);
        }
    };

    if let Err(divergence) = gate.check(mic_time, ref_time) {
        warn!(
            "Mic ({} usec) and reference ({} usec) diverged: {}; passing mic through",
            mic_time, ref_time, divergence
        );
        return (
            QuantumOutcome::Passthrough(PassthroughReason::Diverged(divergence)),
            ref_time,
        );
    }

    match canceller.process(conditioner.reference(), ref_time, mic, mic_time, frames, output) {
        Ok(()) => (QuantumOutcome::Cancelled, ref_time),
        Err(e) => {
            error!("{} canceller failed: {}", canceller.name(), e);
            (QuantumOutcome::Passthrough(PassthroughReason::CancellerFailed), ref_time)
        }
    }
}
