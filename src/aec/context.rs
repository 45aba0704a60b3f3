//! Public surface of the echo cancellation pipeline
//!
//! ```text
//!  playback thread                capture thread                 aec-worker
//!  ───────────────                ──────────────                 ──────────
//!  write_reference_block ──► [reference FIFO + timestamps]
//!                                 process_capture_block
//!                                   │ mic block ──► [mic FIFO + timestamps]
//!                                   │ WorkItem ───────────────────►  condition reference
//!                                   │                                gate on timestamps
//!                                   │                                cancel / pass through
//!                                   │ ◄──────── Completion ────────  [output FIFO]
//!                                   ▼
//!                                 output block (in place)
//! ```
//!
//! Lock order is capture link, then pipeline state. The pipeline state lock
//! only covers the running flag and the reference handle; producers push
//! and the worker processes with no lock held.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::aec::canceller::{create_canceller, CancellerFactory};
use crate::aec::endpoint::{EndpointConfig, EndpointProducer, StreamEndpoint};
use crate::aec::pipeline::{build_conditioner, CapturePipeline, QuantumOutcome, SharedPipeline};
use crate::aec::stats::StatsSnapshot;
use crate::aec::worker::{AecWorker, Completion, Job, WorkItem};
use crate::audio::buffer::SharedByteFifo;
use crate::audio::format::{SampleFormat, StreamFormat};
use crate::config::AecConfig;
use crate::error::{Error, PipelineError, Result};
use crate::sync::gate::Transition;

/// Fill levels and loss counters of every queue, for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLevels {
    pub reference_audio: usize,
    pub reference_timestamps: usize,
    pub mic_audio: usize,
    pub mic_timestamps: usize,
    pub output: usize,
    /// Reference bytes dropped because the FIFO was full
    pub reference_dropped_bytes: usize,
    /// Reference reads that came up short
    pub reference_short_reads: usize,
    pub mic_dropped_bytes: usize,
    pub output_dropped_bytes: usize,
}

/// Capture-thread side of a configured microphone
struct CaptureLink {
    worker: AecWorker,
    mic: EndpointProducer,
    output: SharedByteFifo,
    format: StreamFormat,
    quantum_bytes: usize,
    next_sequence: u64,
    /// Items submitted but not yet completed
    pending: usize,
    /// Output bytes owed to blocks that already went out raw
    stale_output_bytes: usize,
    /// Flush wanted but not yet queued
    flush_requested: bool,
    /// Flush queued but not yet done
    flush_pending: bool,
}

impl CaptureLink {
    fn complete(&mut self, completion: Completion) {
        self.pending = self.pending.saturating_sub(1);
        if completion.outcome == QuantumOutcome::Flushed {
            // Everything owed before the flush went with the output FIFO
            self.flush_pending = false;
            self.stale_output_bytes = 0;
        }
    }

    fn collect_completions(&mut self) {
        while let Some(completion) = self.worker.try_completion() {
            self.complete(completion);
        }
    }

    fn flushing(&self) -> bool {
        self.flush_requested || self.flush_pending
    }

    /// Queue the requested flush and wait up to `timeout` for it
    fn flush(&mut self, timeout: Duration) -> Result<()> {
        if self.flush_requested {
            let item = WorkItem {
                sequence: self.next_sequence,
                job: Job::Flush,
            };
            if !self.worker.submit(item)? {
                warn!("AEC work queue full, flush deferred");
                return Ok(());
            }
            self.next_sequence += 1;
            self.pending += 1;
            self.flush_requested = false;
            self.flush_pending = true;
        }

        let deadline = Instant::now() + timeout;
        while self.flush_pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.worker.wait_completion(remaining)? {
                Some(completion) => self.complete(completion),
                None => break,
            }
        }
        Ok(())
    }

    fn discard_stale(&mut self) {
        if self.stale_output_bytes == 0 {
            return;
        }
        let dropped = self
            .output
            .discard(self.stale_output_bytes.min(self.output.available_to_read()));
        self.stale_output_bytes -= dropped;
        if dropped > 0 {
            trace!("Dropped {} bytes of late output", dropped);
        }
    }
}

/// Timestamp-synchronized echo cancellation context
///
/// One instance serves one playback stream (the echo reference) and one
/// capture stream. All methods take `&self`; share it between the playback
/// and capture threads with an `Arc`.
pub struct AecContext {
    config: AecConfig,
    shared: Arc<SharedPipeline>,
    capture: Mutex<Option<CaptureLink>>,
    canceller_factory: Option<Arc<CancellerFactory>>,
}

impl AecContext {
    pub fn new(config: AecConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Arc::new(SharedPipeline::default()),
            capture: Mutex::new(None),
            canceller_factory: None,
        })
    }

    /// Use `factory` instead of the configured canceller kind
    pub fn with_canceller_factory(mut self, factory: Arc<CancellerFactory>) -> Self {
        self.canceller_factory = Some(factory);
        self
    }

    pub fn config(&self) -> &AecConfig {
        &self.config
    }

    /// Open the echo reference (playback) direction. Replaces any previous
    /// reference; the new stream starts out not running.
    pub fn configure_reference(&self, endpoint: EndpointConfig) -> Result<()> {
        let format = endpoint.format;
        if format.sample_format != SampleFormat::S16Le {
            return Err(Error::Config(format!(
                "echo reference must be 16-bit, got {:?}",
                format.sample_format
            )));
        }
        let mic_format = self.shared.state.lock().mic_format;
        if let Some(mic) = mic_format.as_ref() {
            build_conditioner(&self.config, format, mic)?;
        }

        let period_bytes = format.bytes_for_frames(self.config.reference_period_frames);
        let producer = StreamEndpoint::new(
            "reference",
            endpoint,
            period_bytes * self.config.reference_period_count,
            self.config.timestamp_fifo_records,
        )?
        .producer();

        let mut state = self.shared.state.lock();
        if state.install_reference(producer).is_some() {
            debug!("Previous echo reference replaced");
        }
        state.running.clear();
        info!(
            "Echo reference configured: {} Hz, {} channels, {:?}",
            format.sample_rate, format.channels, format.sample_format
        );
        Ok(())
    }

    /// Open the microphone direction and start the worker. On failure
    /// nothing stays allocated.
    pub fn configure_microphone(&self, endpoint: EndpointConfig) -> Result<()> {
        let mut link = self.capture.lock();
        if link.is_some() {
            info!("Microphone reconfigured, restarting AEC");
            self.stop_capture(&mut link);
        }

        let format = endpoint.format;
        let reference_format = self
            .shared
            .state
            .lock()
            .reference
            .as_ref()
            .map(|slot| *slot.producer.format());
        if let Some(reference) = reference_format {
            build_conditioner(&self.config, reference, &format)?;
        }

        let pipeline = CapturePipeline::new(&self.config, endpoint, |params| match &self.canceller_factory {
            Some(factory) => (**factory)(params),
            None => create_canceller(self.config.canceller, params),
        })?;
        let mic = pipeline.mic_producer();
        let output = pipeline.output();
        let quantum_bytes = pipeline.quantum_bytes();
        let worker = AecWorker::spawn(pipeline, self.shared.clone(), self.config.mic_fifo_quanta)?;

        self.shared.state.lock().mic_format = Some(format);
        *link = Some(CaptureLink {
            worker,
            mic,
            output,
            format,
            quantum_bytes,
            next_sequence: 0,
            pending: 0,
            stale_output_bytes: 0,
            flush_requested: false,
            flush_pending: false,
        });
        info!(
            "Microphone configured: {} Hz, {} channels, {:?}, {}-byte quantum",
            format.sample_rate, format.channels, format.sample_format, quantum_bytes
        );
        Ok(())
    }

    /// Queue one block of loudspeaker audio as echo reference
    pub fn write_reference_block(&self, buffer: &[u8]) -> Result<()> {
        let producer = self
            .shared
            .state
            .lock()
            .reference
            .as_ref()
            .map(|slot| slot.producer.clone())
            .ok_or(PipelineError::NotConfigured("reference"))?;
        producer.format().check_block(buffer.len())?;

        producer.push(buffer).map(|_| ()).map_err(|e| {
            self.shared.stats.inc_short_write();
            Error::from(e)
        })
    }

    /// Run one capture block through the pipeline, in place.
    ///
    /// On success `buffer` holds the echo-cancelled (or passed-through)
    /// audio. On [`PipelineError::Underrun`] it still holds the raw
    /// microphone samples and can be used as is.
    pub fn process_capture_block(&self, buffer: &mut [u8]) -> Result<()> {
        let mut guard = self.capture.lock();
        let link = guard
            .as_mut()
            .ok_or(PipelineError::NotConfigured("microphone"))?;
        let bytes = buffer.len();
        link.format.check_block(bytes)?;
        link.collect_completions();

        let transition = self.shared.state.lock().running.observe();
        match transition {
            Transition::NotRunning => {
                trace!("Echo reference not running, passing capture through");
                return Ok(());
            }
            Transition::Started => {
                info!("Echo reference started, flushing queues and resetting canceller");
                link.flush_requested = true;
                self.shared.stats.inc_flush();
            }
            Transition::Running => {}
        }

        if link.flushing() {
            link.flush(self.config.worker_timeout())?;
            if link.flushing() {
                debug!("Flush still in progress, passing capture through");
                self.shared.stats.inc_not_ready();
                return Ok(());
            }
        }

        if let Err(e) = link.mic.push(buffer) {
            warn!("Mic FIFO overflow: {}", e);
            self.shared.stats.inc_short_write();
        }
        let ready_quanta = link.mic.queues().audio.available_to_read() / link.quantum_bytes;

        let mut submitted = 0;
        for _ in 0..ready_quanta.saturating_sub(link.pending) {
            let item = WorkItem {
                sequence: link.next_sequence,
                job: Job::Quantum {
                    bytes: link.quantum_bytes,
                },
            };
            if !link.worker.submit(item)? {
                warn!("AEC work queue full, {} items pending", link.pending);
                break;
            }
            link.next_sequence += 1;
            link.pending += 1;
            submitted += 1;
        }

        link.discard_stale();
        let deadline = Instant::now() + self.config.worker_timeout();
        while link.output.available_to_read() < bytes && link.pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match link.worker.wait_completion(remaining)? {
                Some(completion) => {
                    link.complete(completion);
                    link.discard_stale();
                }
                None => break,
            }
        }

        let available = link.output.available_to_read();
        if available >= bytes {
            link.output.read(buffer);
            return Ok(());
        }

        // This block goes out raw; its processed output is dropped on arrival
        link.stale_output_bytes += bytes;
        if submitted == 0 && link.pending == 0 {
            debug!("Less than one quantum queued, passing capture through");
            self.shared.stats.inc_not_ready();
            return Ok(());
        }

        warn!(
            "AEC output underrun: {} of {} bytes, {} items pending",
            available, bytes, link.pending
        );
        self.shared.stats.inc_underrun();
        Err(PipelineError::Underrun {
            available,
            requested: bytes,
        }
        .into())
    }

    /// Mark the echo reference as playing or stopped
    pub fn set_reference_running(&self, running: bool) {
        let mut state = self.shared.state.lock();
        if state.running.is_running() != running {
            debug!("Echo reference running: {}", running);
        }
        state.running.set(running);
    }

    pub fn is_reference_running(&self) -> bool {
        self.shared.state.lock().running.is_running()
    }

    /// Close the echo reference. Capture keeps working as passthrough.
    pub fn teardown_reference(&self) {
        let mut state = self.shared.state.lock();
        state.running.clear();
        if let Some(slot) = state.reference.take() {
            info!(
                "Echo reference released, {} bytes discarded",
                slot.producer.queues().audio.available_to_read()
            );
        }
    }

    /// Stop the worker and close the microphone direction
    pub fn teardown_microphone(&self) {
        let mut link = self.capture.lock();
        self.stop_capture(&mut link);
    }

    pub fn is_microphone_configured(&self) -> bool {
        self.capture.lock().is_some()
    }

    fn stop_capture(&self, link: &mut Option<CaptureLink>) {
        let Some(mut link) = link.take() else {
            return;
        };
        self.shared.state.lock().mic_format = None;
        link.worker.stop();
        info!("Microphone released");
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn queue_levels(&self) -> QueueLevels {
        let mut levels = QueueLevels::default();
        if let Some(link) = self.capture.lock().as_ref() {
            let mic = link.mic.queues();
            levels.mic_audio = mic.audio.available_to_read();
            levels.mic_timestamps = mic.timestamps.available_to_read();
            levels.mic_dropped_bytes = mic.audio.overflow_count();
            levels.output = link.output.available_to_read();
            levels.output_dropped_bytes = link.output.overflow_count();
        }
        if let Some(slot) = self.shared.state.lock().reference.as_ref() {
            let reference = slot.producer.queues();
            levels.reference_audio = reference.audio.available_to_read();
            levels.reference_timestamps = reference.timestamps.available_to_read();
            levels.reference_dropped_bytes = reference.audio.overflow_count();
            levels.reference_short_reads = reference.audio.underrun_count();
        }
        levels
    }
}

impl Drop for AecContext {
    fn drop(&mut self) {
        self.teardown_microphone();
        self.teardown_reference();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_16k() -> EndpointConfig {
        EndpointConfig::new(StreamFormat::new(16_000, 1, SampleFormat::S16Le))
    }

    #[test]
    fn test_capture_requires_microphone() {
        let ctx = AecContext::new(AecConfig::default()).unwrap();
        let mut block = [0u8; 320];
        assert!(matches!(
            ctx.process_capture_block(&mut block),
            Err(Error::Pipeline(PipelineError::NotConfigured("microphone")))
        ));
        assert!(matches!(
            ctx.write_reference_block(&block),
            Err(Error::Pipeline(PipelineError::NotConfigured("reference")))
        ));
    }

    #[test]
    fn test_failed_configure_leaves_nothing_behind() {
        let ctx = AecContext::new(AecConfig::default()).unwrap();
        let zero_channels = EndpointConfig::new(StreamFormat::new(16_000, 0, SampleFormat::S16Le));
        assert!(ctx.configure_microphone(zero_channels).is_err());
        assert!(!ctx.is_microphone_configured());
        assert!(ctx.shared.state.lock().mic_format.is_none());
        assert_eq!(ctx.queue_levels(), QueueLevels::default());
    }

    #[test]
    fn test_reference_rejects_partial_frames() {
        let ctx = AecContext::new(AecConfig::default()).unwrap();
        ctx.configure_reference(EndpointConfig::new(StreamFormat::new(
            48_000,
            2,
            SampleFormat::S16Le,
        )))
        .unwrap();
        assert!(matches!(
            ctx.write_reference_block(&[0u8; 6]),
            Err(Error::Pipeline(PipelineError::InvalidBlock(6)))
        ));
        ctx.write_reference_block(&[0u8; 8]).unwrap();
        assert_eq!(ctx.queue_levels().reference_audio, 8);
    }

    #[test]
    fn test_reference_overflow_is_counted() {
        let config = AecConfig {
            reference_period_frames: 4,
            reference_period_count: 1,
            ..Default::default()
        };
        let ctx = AecContext::new(config).unwrap();
        ctx.configure_reference(mono_16k()).unwrap();

        assert!(matches!(
            ctx.write_reference_block(&[0u8; 12]),
            Err(Error::Buffer(_))
        ));
        let levels = ctx.queue_levels();
        assert_eq!(levels.reference_audio, 8);
        assert_eq!(levels.reference_dropped_bytes, 4);
        assert_eq!(ctx.stats().short_writes, 1);
    }

    #[test]
    fn test_reconfigured_reference_stops_running() {
        let ctx = AecContext::new(AecConfig::default()).unwrap();
        ctx.configure_reference(mono_16k()).unwrap();
        ctx.set_reference_running(true);
        ctx.write_reference_block(&[1u8; 64]).unwrap();

        ctx.configure_reference(mono_16k()).unwrap();
        assert!(!ctx.is_reference_running());
        assert_eq!(ctx.queue_levels().reference_audio, 0);
    }

    #[test]
    fn test_reference_torn_down_mid_stream() {
        let ctx = AecContext::new(AecConfig::default()).unwrap();
        ctx.configure_reference(mono_16k()).unwrap();
        ctx.configure_microphone(mono_16k()).unwrap();
        ctx.set_reference_running(true);
        ctx.teardown_reference();
        assert!(!ctx.is_reference_running());

        let mut block = [7u8; 320];
        ctx.process_capture_block(&mut block).unwrap();
        assert_eq!(block, [7u8; 320]);
        ctx.teardown_microphone();
        assert!(!ctx.is_microphone_configured());
    }
}
