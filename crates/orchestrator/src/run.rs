//! Run driver: wires the allocator, worker, retry controller, scheduler and
//! checkpoint publisher together for one batch.

use async_trait::async_trait;
use events::{Event, EventBus};
use isobatch_core::{CheckpointState, Job, JobOutcome};
use sandbox::Sandbox;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use vcs::{VersionControl, WorkspaceAllocator};

use crate::checkpoint::{CheckpointPolicy, CheckpointPublisher, CheckpointStore};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::jobs::validate_jobs;
use crate::output::OutputStore;
use crate::retry::{IsolatedAttemptExecutor, RetryController, RetryPolicy};
use crate::scheduler::{CompletionSink, Scheduler};
use crate::worker::{JobRunner, Validator, WorkerUnit};

/// Process exit status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Success,
    JobsFailed,
    Precondition,
    Checkpoint,
}

impl RunExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::JobsFailed => 1,
            Self::Precondition => 2,
            Self::Checkpoint => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_token: String,
    /// Terminal outcomes in completion order.
    pub outcomes: Vec<JobOutcome>,
    /// Commit, publish or failure-log errors hit after a completion.
    pub checkpoint_errors: Vec<String>,
    pub checkpoint: CheckpointState,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Job failures take precedence over checkpoint errors.
    pub fn exit(&self) -> RunExit {
        if self.failed() > 0 {
            RunExit::JobsFailed
        } else if !self.checkpoint_errors.is_empty() {
            RunExit::Checkpoint
        } else {
            RunExit::Success
        }
    }
}

/// Persists failure records and drives the checkpoint publisher.
struct RunSink<'a> {
    output: &'a OutputStore,
    publisher: CheckpointPublisher,
    errors: Vec<String>,
    event_bus: Option<EventBus>,
}

impl RunSink<'_> {
    fn record_error(&mut self, context: &str, message: String) {
        if let Some(bus) = &self.event_bus {
            bus.emit(Event::Error {
                message: message.clone(),
                context: Some(context.to_string()),
            });
        }
        self.errors.push(message);
    }
}

#[async_trait]
impl CompletionSink for RunSink<'_> {
    async fn on_completed(&mut self, outcome: &JobOutcome) {
        if let Some(record) = &outcome.failure {
            if let Err(e) = self.output.record_failure(record).await {
                error!(job_id = %outcome.job_id, error = %e, "Failed to write failure log");
                self.record_error("failure_log", format!("failure log for {}: {}", outcome.job_id, e));
            }
        }

        match self.publisher.on_job_completed(outcome).await {
            Ok(action) => {
                if let Some(revision) = action.committed {
                    info!(revision = %revision, published = action.published, "Checkpoint");
                }
            }
            Err(e) => {
                error!(job_id = %outcome.job_id, error = %e, "Checkpoint failed");
                self.record_error("checkpoint", e.to_string());
            }
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    vcs: Arc<dyn VersionControl>,
    sandbox: Arc<dyn Sandbox>,
    runner: Arc<dyn JobRunner>,
    validator: Arc<dyn Validator>,
    event_bus: Option<EventBus>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        vcs: Arc<dyn VersionControl>,
        sandbox: Arc<dyn Sandbox>,
        runner: Arc<dyn JobRunner>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            config,
            vcs,
            sandbox,
            runner,
            validator,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Process `jobs` to completion.
    ///
    /// Returns `Err` only when the run cannot start; per-job failures and
    /// checkpoint errors are reported in the [`RunReport`].
    pub async fn start_run(&self, jobs: Vec<Job>) -> Result<RunReport> {
        self.check_preconditions(&jobs).await?;

        let run_token = Uuid::new_v4().simple().to_string()[..8].to_string();
        let cap = self.config.concurrency_cap()?;
        info!(
            run_token = %run_token,
            jobs = jobs.len(),
            cap = cap.get(),
            repo = %self.config.repo_path.display(),
            "Starting run"
        );

        let allocator = Arc::new(WorkspaceAllocator::new(
            Arc::clone(&self.vcs),
            self.config.workspace_config(&run_token),
        ));
        let output = Arc::new(OutputStore::from_config(&self.config));

        let bus = self.event_bus.clone();
        let mut worker = WorkerUnit::new(Arc::clone(&self.runner), Arc::clone(&self.validator));
        if let Some(bus) = &bus {
            worker = worker.with_event_bus(bus.clone());
        }
        let mut executor =
            IsolatedAttemptExecutor::new(Arc::clone(&allocator), worker, Arc::clone(&output));
        if let Some(bus) = &bus {
            executor = executor.with_event_bus(bus.clone());
        }
        let mut controller =
            RetryController::new(Arc::new(executor), RetryPolicy::new(self.config.max_attempts));
        if let Some(bus) = &bus {
            controller = controller.with_event_bus(bus.clone());
        }
        let mut scheduler = Scheduler::new(Arc::new(controller));
        if let Some(bus) = &bus {
            scheduler = scheduler.with_event_bus(bus.clone());
        }

        let mut publisher = CheckpointPublisher::open(
            Arc::clone(&self.vcs),
            CheckpointStore::new(self.config.checkpoint_path()),
            CheckpointPolicy::from_config(&self.config),
            allocator.repo_lock(),
        )
        .await?;
        if let Some(bus) = &bus {
            publisher = publisher.with_event_bus(bus.clone());
        }

        self.emit(Event::RunStarted {
            total_jobs: jobs.len(),
            concurrency: cap.get(),
        });
        scheduler.enqueue(jobs);

        let mut sink = RunSink {
            output: &output,
            publisher,
            errors: Vec::new(),
            event_bus: bus,
        };
        let outcomes = scheduler.run(cap, &mut sink).await;

        let report = RunReport {
            run_token,
            outcomes,
            checkpoint_errors: sink.errors,
            checkpoint: sink.publisher.state().clone(),
        };
        self.emit(Event::RunFinished {
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            checkpoint_errors = report.checkpoint_errors.len(),
            "Run finished"
        );
        Ok(report)
    }

    async fn check_preconditions(&self, jobs: &[Job]) -> Result<()> {
        self.config.validate()?;

        if !self.vcs.is_initialized().await? {
            return Err(OrchestratorError::Precondition(format!(
                "{} is not a {} repository",
                self.config.repo_path.display(),
                self.vcs.name()
            )));
        }
        if !self.sandbox.is_available().await {
            return Err(OrchestratorError::Precondition(format!(
                "sandbox {} is not available",
                self.sandbox.name()
            )));
        }
        validate_jobs(jobs)?;

        if jobs.is_empty() {
            warn!("No jobs to process");
        }
        Ok(())
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isobatch_core::{FailureRecord, JobId, JobStatus};
    use std::path::PathBuf;

    fn succeeded(id: &str) -> JobOutcome {
        JobOutcome {
            job_id: JobId::slugify(id),
            status: JobStatus::Succeeded,
            attempts: 1,
            repairs: 0,
            reason: None,
            artifact: Some(PathBuf::from(format!("output/{}.json", id))),
            failure: None,
        }
    }

    fn failed(id: &str) -> JobOutcome {
        let record = FailureRecord::new(
            JobId::slugify(id),
            2,
            "validation failed",
            None,
            PathBuf::from(format!("output/{}.json", id)),
        );
        JobOutcome::failed(record, 1)
    }

    fn report(outcomes: Vec<JobOutcome>, checkpoint_errors: Vec<String>) -> RunReport {
        RunReport {
            run_token: "t0".to_string(),
            outcomes,
            checkpoint_errors,
            checkpoint: CheckpointState::default(),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(vec![succeeded("a")], vec![]).exit(), RunExit::Success);
        assert_eq!(
            report(vec![succeeded("a"), failed("b")], vec![]).exit(),
            RunExit::JobsFailed
        );
        assert_eq!(
            report(vec![succeeded("a")], vec!["push rejected".into()]).exit(),
            RunExit::Checkpoint
        );
        // Job failures win over checkpoint errors.
        assert_eq!(
            report(vec![failed("b")], vec!["push rejected".into()]).exit(),
            RunExit::JobsFailed
        );
        assert_eq!(report(vec![], vec![]).exit(), RunExit::Success);
    }

    #[test]
    fn test_exit_code_values() {
        assert_eq!(RunExit::Success.code(), 0);
        assert_eq!(RunExit::JobsFailed.code(), 1);
        assert_eq!(RunExit::Precondition.code(), 2);
        assert_eq!(RunExit::Checkpoint.code(), 3);
    }

    #[test]
    fn test_counts() {
        let report = report(vec![succeeded("a"), failed("b"), succeeded("c")], vec![]);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
    }
}
