use isobatch_core::CoreError;
use sandbox::SandboxError;
use thiserror::Error;
use vcs::VcsError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The run cannot start at all; nothing has been dispatched.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Workspace allocation failed: {0}")]
    Allocation(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Job {job_id} failed after {attempts} attempt(s): {reason}")]
    TerminalFailure {
        job_id: String,
        attempts: u8,
        reason: String,
    },

    #[error("Commit refused: staged changes outside the output directory: {}", paths.join(", "))]
    CommitPolicyViolation { paths: Vec<String> },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Worker command failed: {0}")]
    Runner(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),

    #[error("State error: {0}")]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    pub fn terminal(job_id: impl Into<String>, attempts: u8, reason: impl Into<String>) -> Self {
        Self::TerminalFailure {
            job_id: job_id.into(),
            attempts,
            reason: reason.into(),
        }
    }

    /// Errors that stop the whole run before dispatch.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Self::Precondition(_) | Self::InvalidConfig(_))
    }
}

impl From<SandboxError> for OrchestratorError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Unavailable(msg) => Self::SandboxUnavailable(msg),
            other => Self::Runner(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
