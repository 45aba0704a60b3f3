//! Dedicated echo cancellation thread
//!
//! The worker owns the [`CapturePipeline`]. The capture path hands it one
//! [`WorkItem`] per queued quantum over a bounded channel and waits for the
//! matching [`Completion`]. Before each job the worker takes the shared lock
//! just long enough to snapshot the running flag and the reference handle;
//! reading, conditioning, cancelling and dumping all happen unlocked.
//! Dropping the work sender wakes a parked worker so it can exit.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thread_priority::{set_current_thread_priority, ThreadPriority};
use tracing::{debug, error, info, warn};

use crate::aec::pipeline::{CapturePipeline, QuantumOutcome, SharedPipeline};
use crate::error::{PipelineError, Result};

/// What the worker is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Process the next queued mic quantum of `bytes` bytes
    Quantum { bytes: usize },
    /// Empty every queue and reset the canceller
    Flush,
}

/// Request to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub sequence: u64,
    pub job: Job,
}

/// Reply for a finished work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub sequence: u64,
    pub outcome: QuantumOutcome,
}

/// Handle to the worker thread
pub struct AecWorker {
    running: Arc<AtomicBool>,
    work_tx: Option<Sender<WorkItem>>,
    done_rx: Receiver<Completion>,
    thread_handle: Option<JoinHandle<()>>,
}

impl AecWorker {
    /// Start the worker on `pipeline`. `queue_depth` bounds the number of
    /// outstanding quanta; one extra slot is kept for a flush.
    pub fn spawn(pipeline: CapturePipeline, shared: Arc<SharedPipeline>, queue_depth: usize) -> Result<Self> {
        let (work_tx, work_rx) = bounded::<WorkItem>(queue_depth.max(1) + 1);
        let (done_tx, done_rx) = unbounded::<Completion>();
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("aec-worker".into())
            .spawn(move || run(pipeline, shared, running_for_loop, work_rx, done_tx))
            .map_err(|e| PipelineError::WorkerSpawn(e.to_string()))?;

        info!("AEC worker started");
        Ok(Self {
            running,
            work_tx: Some(work_tx),
            done_rx,
            thread_handle: Some(handle),
        })
    }

    /// Queue an item without blocking. `Ok(false)` means the queue is full.
    pub fn submit(&self, item: WorkItem) -> Result<bool> {
        let Some(tx) = self.work_tx.as_ref() else {
            return Err(PipelineError::WorkerGone.into());
        };
        match tx.try_send(item) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => Err(PipelineError::WorkerGone.into()),
        }
    }

    /// Wait up to `timeout` for the next completion. `Ok(None)` on timeout.
    pub fn wait_completion(&self, timeout: Duration) -> Result<Option<Completion>> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(completion) => Ok(Some(completion)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::WorkerGone.into()),
        }
    }

    /// A completion already delivered, if any
    pub fn try_completion(&self) -> Option<Completion> {
        self.done_rx.try_recv().ok()
    }

    /// Signal the worker to stop and join it
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.work_tx.take();

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("AEC worker panicked");
            }
            info!("AEC worker stopped");
        }
    }
}

impl Drop for AecWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn raise_priority() {
    match set_current_thread_priority(ThreadPriority::Max) {
        Ok(()) => debug!("AEC worker running at maximum priority"),
        Err(e) => warn!("Could not raise AEC worker priority: {:?}", e),
    }
}

fn run(
    mut pipeline: CapturePipeline,
    shared: Arc<SharedPipeline>,
    running: Arc<AtomicBool>,
    work_rx: Receiver<WorkItem>,
    done_tx: Sender<Completion>,
) {
    raise_priority();

    while let Ok(item) = work_rx.recv() {
        let snapshot = shared.snapshot();
        pipeline.sync_reference(snapshot.reference.as_ref());

        let outcome = match item.job {
            Job::Quantum { bytes } => {
                let outcome = pipeline.process_quantum(snapshot.running, &shared.stats);
                debug!("Quantum {} ({} bytes): {:?}", item.sequence, bytes, outcome);
                outcome
            }
            Job::Flush => {
                pipeline.flush_all();
                debug!("Flush {} done", item.sequence);
                QuantumOutcome::Flushed
            }
        };

        // The capture side may already be gone
        let _ = done_tx.send(Completion {
            sequence: item.sequence,
            outcome,
        });

        if !running.load(Ordering::Relaxed) {
            break;
        }
    }
    debug!("AEC worker loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aec::canceller::{create_canceller, CancellerKind};
    use crate::aec::endpoint::EndpointConfig;
    use crate::audio::format::{SampleFormat, StreamFormat};
    use crate::config::AecConfig;

    fn pipeline() -> CapturePipeline {
        let mic = EndpointConfig::new(StreamFormat::new(16_000, 1, SampleFormat::S16Le));
        CapturePipeline::new(&AecConfig::default(), mic, |params| {
            create_canceller(CancellerKind::Bypass, params)
        })
        .unwrap()
    }

    #[test]
    fn test_empty_mic_completes_as_skipped() {
        let shared = Arc::new(SharedPipeline::default());
        let worker = AecWorker::spawn(pipeline(), shared, 4).unwrap();

        let item = WorkItem {
            sequence: 7,
            job: Job::Quantum { bytes: 320 },
        };
        assert!(worker.submit(item).unwrap());
        let done = worker
            .wait_completion(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(
            done,
            Completion {
                sequence: 7,
                outcome: QuantumOutcome::Skipped
            }
        );
    }

    #[test]
    fn test_flush_job_empties_mic_and_output() {
        let shared = Arc::new(SharedPipeline::default());
        let pipeline = pipeline();
        let mic = pipeline.mic_producer();
        let output = pipeline.output();
        mic.push(&[1u8; 100]).unwrap();
        output.write(&[2u8; 64]);

        let worker = AecWorker::spawn(pipeline, shared, 4).unwrap();
        assert!(worker
            .submit(WorkItem {
                sequence: 1,
                job: Job::Flush
            })
            .unwrap());
        let done = worker
            .wait_completion(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(done.outcome, QuantumOutcome::Flushed);
        assert!(mic.queues().is_empty());
        assert!(output.is_empty());
        assert!(worker.try_completion().is_none());
    }

    #[test]
    fn test_stop_joins_parked_worker() {
        let shared = Arc::new(SharedPipeline::default());
        let mut worker = AecWorker::spawn(pipeline(), shared, 4).unwrap();

        worker.stop();
        assert!(worker.thread_handle.is_none());
        assert!(matches!(
            worker.submit(WorkItem {
                sequence: 1,
                job: Job::Flush
            }),
            Err(crate::Error::Pipeline(PipelineError::WorkerGone))
        ));
    }
}
