//! Concurrency gate.
//!
//! A single control loop owns the pending queue and the set of running
//! jobs. It admits jobs in FIFO order while fewer than `cap` are running and
//! otherwise waits for any running job to finish. Completions are handed to
//! the [`CompletionSink`] one at a time, in the loop, so sink state needs no
//! further synchronization.

use async_trait::async_trait;
use events::{Event, EventBus};
use futures::FutureExt;
use isobatch_core::{FailureRecord, Job, JobOutcome};
use std::any::Any;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Unit of dispatch: takes a job to its terminal outcome.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn run_job(&self, job: Job) -> JobOutcome;

    /// Where the job's artifact would be published; used for failure
    /// records the processor could not produce itself.
    fn destination(&self, job: &Job) -> PathBuf {
        PathBuf::from(&job.output_name)
    }
}

/// Receives every terminal outcome, in completion order.
#[async_trait]
pub trait CompletionSink: Send {
    async fn on_completed(&mut self, outcome: &JobOutcome);
}

/// Sink that ignores completions.
pub struct NoopSink;

#[async_trait]
impl CompletionSink for NoopSink {
    async fn on_completed(&mut self, _outcome: &JobOutcome) {}
}

pub struct Scheduler<P: JobProcessor> {
    processor: Arc<P>,
    pending: VecDeque<Job>,
    event_bus: Option<EventBus>,
}

impl<P: JobProcessor> Scheduler<P> {
    pub fn new(processor: Arc<P>) -> Self {
        Self {
            processor,
            pending: VecDeque::new(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn enqueue(&mut self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            if let Some(bus) = &self.event_bus {
                bus.emit(Event::JobQueued {
                    job_id: job.id.to_string(),
                });
            }
            self.pending.push_back(job);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drain the queue with at most `cap` jobs in flight. Returns outcomes in
    /// completion order.
    pub async fn run(
        &mut self,
        cap: NonZeroUsize,
        sink: &mut dyn CompletionSink,
    ) -> Vec<JobOutcome> {
        let mut running: JoinSet<JobOutcome> = JoinSet::new();
        let mut outcomes = Vec::with_capacity(self.pending.len());
        info!(pending = self.pending.len(), cap = cap.get(), "Scheduler started");

        self.admit(&mut running, cap);
        while let Some(joined) = running.join_next().await {
            // Refill before the sink runs so a slow checkpoint does not idle
            // the pool.
            self.admit(&mut running, cap);
            match joined {
                Ok(outcome) => {
                    debug!(
                        job_id = %outcome.job_id,
                        status = outcome.status.as_str(),
                        running = running.len(),
                        pending = self.pending.len(),
                        "Job finished"
                    );
                    sink.on_completed(&outcome).await;
                    outcomes.push(outcome);
                }
                Err(e) => error!(error = %e, "Job task was cancelled"),
            }
        }

        info!(completed = outcomes.len(), "Scheduler drained");
        outcomes
    }

    fn admit(&mut self, running: &mut JoinSet<JobOutcome>, cap: NonZeroUsize) {
        while running.len() < cap.get() {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            debug!(job_id = %job.id, "Admitting job");

            let processor = Arc::clone(&self.processor);
            running.spawn(async move {
                let job_id = job.id.clone();
                let destination = processor.destination(&job);
                match AssertUnwindSafe(processor.run_job(job)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let reason = format!("worker task panicked: {}", panic_message(&*panic));
                        error!(job_id = %job_id, reason = %reason, "Job panicked");
                        JobOutcome::failed(FailureRecord::new(job_id, 1, &reason, None, destination), 0)
                    }
                }
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
