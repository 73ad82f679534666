//! Bounded retry.
//!
//! Two independent tiers: the worker may repair once inside an attempt, and
//! the controller may re-spawn a failed job once as a fresh attempt in a
//! fresh workspace. A job therefore costs at most two attempts.

use async_trait::async_trait;
use events::{Event, EventBus};
use isobatch_core::{Attempt, AttemptNumber, FailureRecord, Job, JobOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use vcs::WorkspaceAllocator;

use crate::error::OrchestratorError;
use crate::guard::WorkspaceGuard;
use crate::output::OutputStore;
use crate::scheduler::JobProcessor;
use crate::worker::{Correction, WorkerUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    /// Clamped to `1..=2`.
    pub fn new(max_attempts: u8) -> Self {
        Self {
            max_attempts: max_attempts.clamp(1, 2),
        }
    }

    pub fn max_attempts(&self) -> u8 {
        self.max_attempts
    }

    /// The attempt to re-spawn after `failed`, if the budget allows one.
    pub fn respawn_after(&self, failed: AttemptNumber) -> Option<AttemptNumber> {
        failed.next().filter(|next| next.get() <= self.max_attempts)
    }
}

/// What one attempt left behind.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub attempt: Attempt,
    /// Published destination on success, quarantined copy on failure.
    pub artifact: Option<PathBuf>,
    /// Set when the attempt itself passed but its result could not be
    /// published.
    pub publish_error: Option<String>,
}

impl AttemptReport {
    pub fn new(attempt: Attempt) -> Self {
        Self {
            attempt,
            artifact: None,
            publish_error: None,
        }
    }

    /// An attempt that never reached its worker.
    pub fn aborted(job: &Job, number: AttemptNumber, error: &OrchestratorError) -> Self {
        let mut attempt = Attempt::new(job.id.clone(), number);
        if let Err(e) = attempt.fail(error.to_string()) {
            warn!(job_id = %job.id, error = %e, "Could not mark aborted attempt as failed");
            attempt.failure_reason = Some(error.to_string());
        }
        Self::new(attempt)
    }

    pub fn succeeded(&self) -> bool {
        self.attempt.succeeded() && self.publish_error.is_none()
    }

    pub fn reason(&self) -> String {
        self.publish_error
            .clone()
            .or_else(|| self.attempt.failure_reason.clone())
            .unwrap_or_else(|| "attempt failed".to_string())
    }
}

/// Runs one attempt of a job from workspace allocation to reclamation.
#[async_trait]
pub trait AttemptExecutor: Send + Sync {
    async fn run_attempt(
        &self,
        job: &Job,
        number: AttemptNumber,
        correction: Option<&Correction>,
    ) -> AttemptReport;

    /// Where the job's published artifact lives.
    fn destination(&self, job: &Job) -> PathBuf;
}

/// Each attempt gets a fresh worktree; the worktree is reclaimed before the
/// report is returned.
pub struct IsolatedAttemptExecutor {
    allocator: Arc<WorkspaceAllocator>,
    worker: WorkerUnit,
    output: Arc<OutputStore>,
    event_bus: Option<EventBus>,
}

impl IsolatedAttemptExecutor {
    pub fn new(
        allocator: Arc<WorkspaceAllocator>,
        worker: WorkerUnit,
        output: Arc<OutputStore>,
    ) -> Self {
        Self {
            allocator,
            worker,
            output,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}

#[async_trait]
impl AttemptExecutor for IsolatedAttemptExecutor {
    async fn run_attempt(
        &self,
        job: &Job,
        number: AttemptNumber,
        correction: Option<&Correction>,
    ) -> AttemptReport {
        let allocated = match self.allocator.allocate(job, number).await {
            Ok(ws) => ws,
            Err(e) => {
                let error = OrchestratorError::Allocation(e.to_string());
                warn!(job_id = %job.id, attempt = number.get(), error = %error, "Attempt aborted");
                return AttemptReport::aborted(job, number, &error);
            }
        };
        self.emit(Event::WorkspaceAllocated {
            job_id: job.id.to_string(),
            attempt: number.get(),
            path: allocated.path().display().to_string(),
        });

        let guard = WorkspaceGuard::new(
            Arc::clone(&self.allocator),
            allocated,
            self.event_bus.clone(),
        );
        let workspace = guard.workspace();

        let mut report = match self.worker.execute(job, workspace, correction).await {
            Ok(attempt) => AttemptReport::new(attempt),
            Err(e) => AttemptReport::aborted(job, number, &e),
        };

        if report.attempt.succeeded() {
            match self.output.publish_artifact(job, &workspace.output_path).await {
                Ok(dest) => report.artifact = Some(dest),
                Err(e) => report.publish_error = Some(format!("publishing artifact failed: {}", e)),
            }
        }
        if !report.succeeded() {
            match self
                .output
                .quarantine(&job.id, number, &workspace.output_path)
                .await
            {
                Ok(kept) => report.artifact = kept,
                Err(e) => warn!(job_id = %job.id, error = %e, "Could not quarantine artifact"),
            }
        }

        if let Err(e) = guard.reclaim().await {
            warn!(job_id = %job.id, attempt = number.get(), error = %e, "Workspace reclaim failed");
        }

        self.emit(Event::AttemptFinished {
            job_id: job.id.to_string(),
            attempt: number.get(),
            success: report.succeeded(),
        });
        report
    }

    fn destination(&self, job: &Job) -> PathBuf {
        self.output.destination(job)
    }
}

pub struct RetryController {
    executor: Arc<dyn AttemptExecutor>,
    policy: RetryPolicy,
    event_bus: Option<EventBus>,
}

impl RetryController {
    pub fn new(executor: Arc<dyn AttemptExecutor>, policy: RetryPolicy) -> Self {
        Self {
            executor,
            policy,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run the first attempt and resolve the job.
    pub async fn process(&self, job: &Job) -> JobOutcome {
        let first = self
            .executor
            .run_attempt(job, AttemptNumber::First, None)
            .await;
        self.resolve(job, first).await
    }

    /// Turn the first attempt into the job's terminal outcome, re-spawning
    /// once if the policy allows.
    pub async fn resolve(&self, job: &Job, first: AttemptReport) -> JobOutcome {
        let mut repairs = first.attempt.repairs();
        let mut last = first;

        while !last.succeeded() {
            let Some(next) = self.policy.respawn_after(last.attempt.number) else {
                break;
            };
            let correction = Correction {
                previous_reason: last.reason(),
                ..Correction::from_attempt(&last.attempt)
            };
            info!(
                job_id = %job.id,
                attempt = next.get(),
                reason = %correction.previous_reason,
                "Re-spawning job"
            );
            last = self
                .executor
                .run_attempt(job, next, Some(&correction))
                .await;
            repairs += last.attempt.repairs();
        }

        let outcome = if last.succeeded() {
            let artifact = last
                .artifact
                .clone()
                .unwrap_or_else(|| self.executor.destination(job));
            JobOutcome::succeeded(&last.attempt, repairs, artifact)
        } else {
            let attempts = last.attempt.number.get();
            let error = OrchestratorError::terminal(job.id.as_str(), attempts, last.reason());
            warn!(job_id = %job.id, error = %error, "Job terminally failed");
            let record = FailureRecord::new(
                job.id.clone(),
                attempts,
                &last.reason(),
                last.artifact.clone(),
                self.executor.destination(job),
            );
            JobOutcome::failed(record, repairs)
        };

        self.emit(&outcome);
        outcome
    }

    fn emit(&self, outcome: &JobOutcome) {
        let Some(bus) = &self.event_bus else {
            return;
        };
        let event = match &outcome.reason {
            None => Event::JobSucceeded {
                job_id: outcome.job_id.to_string(),
                attempts: outcome.attempts,
            },
            Some(reason) => Event::JobFailed {
                job_id: outcome.job_id.to_string(),
                attempts: outcome.attempts,
                reason: reason.clone(),
            },
        };
        bus.emit(event);
    }
}

#[async_trait]
impl JobProcessor for RetryController {
    async fn run_job(&self, job: Job) -> JobOutcome {
        self.process(&job).await
    }

    fn destination(&self, job: &Job) -> PathBuf {
        self.executor.destination(job)
    }
}
