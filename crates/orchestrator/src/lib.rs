pub mod checkpoint;
pub mod config;
pub mod error;
pub mod guard;
pub mod jobs;
pub mod output;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod worker;

pub use checkpoint::{CheckpointAction, CheckpointPolicy, CheckpointPublisher, CheckpointStore};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use guard::WorkspaceGuard;
pub use jobs::{JobSource, FAILURE_LOG_NAME};
pub use output::OutputStore;
pub use retry::{AttemptExecutor, AttemptReport, IsolatedAttemptExecutor, RetryController, RetryPolicy};
pub use run::{Orchestrator, RunExit, RunReport};
pub use scheduler::{CompletionSink, JobProcessor, Scheduler};
pub use worker::{
    CommandRunner, CommandValidator, Correction, JobRunner, Validator, WorkerCommands,
    WorkerContext, WorkerUnit,
};
