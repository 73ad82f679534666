//! Event types emitted during an orchestration run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Position in the bus's emission order, starting at 1
    pub seq: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create an envelope that has not been sequenced yet (`seq == 0`).
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Run events
    #[serde(rename = "run.started")]
    RunStarted { total_jobs: usize, concurrency: usize },

    #[serde(rename = "run.finished")]
    RunFinished { succeeded: usize, failed: usize },

    // Job events
    /// Job is waiting for an admission slot
    #[serde(rename = "job.queued")]
    JobQueued { job_id: String },

    #[serde(rename = "job.succeeded")]
    JobSucceeded { job_id: String, attempts: u8 },

    #[serde(rename = "job.failed")]
    JobFailed {
        job_id: String,
        attempts: u8,
        reason: String,
    },

    // Attempt events
    #[serde(rename = "attempt.started")]
    AttemptStarted { job_id: String, attempt: u8 },

    /// In-worker repair pass after a failed validation
    #[serde(rename = "attempt.repairing")]
    RepairStarted { job_id: String, attempt: u8 },

    #[serde(rename = "attempt.finished")]
    AttemptFinished {
        job_id: String,
        attempt: u8,
        success: bool,
    },

    // Workspace events
    #[serde(rename = "workspace.allocated")]
    WorkspaceAllocated {
        job_id: String,
        attempt: u8,
        path: String,
    },

    #[serde(rename = "workspace.reclaimed")]
    WorkspaceReclaimed { job_id: String, attempt: u8 },

    // Checkpoint events
    #[serde(rename = "checkpoint.committed")]
    CheckpointCommitted { revision: String, completed: u64 },

    #[serde(rename = "checkpoint.published")]
    CheckpointPublished { remote: String, branch: String },

    // System events
    /// Generic error event
    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Job the event concerns, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Event::JobQueued { job_id }
            | Event::JobSucceeded { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::AttemptStarted { job_id, .. }
            | Event::RepairStarted { job_id, .. }
            | Event::AttemptFinished { job_id, .. }
            | Event::WorkspaceAllocated { job_id, .. }
            | Event::WorkspaceReclaimed { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// Whether the event marks a job's terminal outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::JobSucceeded { .. } | Event::JobFailed { .. })
    }
}
