use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::domain::job::JobId;
use crate::domain::outcome::{single_line, ValidationReport};
use crate::error::{CoreError, Result};

/// Job-level attempt number. There is no third attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptNumber {
    First,
    Second,
}

impl AttemptNumber {
    pub fn get(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
        }
    }

    /// The re-spawn slot, if any remains.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::First => Some(Self::Second),
            Self::Second => None,
        }
    }
}

impl fmt::Display for AttemptNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    #[default]
    Pending,
    Running,
    Validating,
    Repairing,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Repairing => "repairing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "validating" => Some(Self::Validating),
            "repairing" => Some(Self::Repairing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

pub struct AttemptStateMachine;

impl AttemptStateMachine {
    pub fn validate_transition(from: &AttemptStatus, to: &AttemptStatus) -> Result<()> {
        if Self::allowed_transitions(from).contains(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidStatusTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    fn allowed_transitions(from: &AttemptStatus) -> Vec<AttemptStatus> {
        match from {
            AttemptStatus::Pending => vec![AttemptStatus::Running, AttemptStatus::Failed],
            AttemptStatus::Running => vec![AttemptStatus::Validating, AttemptStatus::Failed],
            AttemptStatus::Validating => vec![
                AttemptStatus::Succeeded,
                AttemptStatus::Repairing,
                AttemptStatus::Failed,
            ],
            AttemptStatus::Repairing => vec![AttemptStatus::Validating, AttemptStatus::Failed],
            AttemptStatus::Succeeded | AttemptStatus::Failed => vec![],
        }
    }

    pub fn can_transition(from: &AttemptStatus, to: &AttemptStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}

/// One execution of a job inside one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub job_id: JobId,
    pub number: AttemptNumber,
    pub status: AttemptStatus,
    pub repaired: bool,
    pub validation: Option<ValidationReport>,
    pub artifact_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(job_id: JobId, number: AttemptNumber) -> Self {
        Self {
            job_id,
            number,
            status: AttemptStatus::Pending,
            repaired: false,
            validation: None,
            artifact_path: None,
            failure_reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `to`, enforcing the state machine and the single repair pass.
    pub fn transition(&mut self, to: AttemptStatus) -> Result<()> {
        AttemptStateMachine::validate_transition(&self.status, &to)?;

        if to == AttemptStatus::Repairing {
            if self.repaired {
                return Err(CoreError::RepairBudgetExhausted(self.job_id.to_string()));
            }
            self.repaired = true;
        }

        match to {
            AttemptStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }

        self.status = to;
        Ok(())
    }

    /// Whether the in-worker repair pass is still available.
    pub fn can_repair(&self) -> bool {
        !self.repaired && self.status == AttemptStatus::Validating
    }

    pub fn fail(&mut self, reason: impl AsRef<str>) -> Result<()> {
        self.transition(AttemptStatus::Failed)?;
        self.failure_reason = Some(single_line(reason.as_ref()));
        Ok(())
    }

    pub fn succeeded(&self) -> bool {
        self.status == AttemptStatus::Succeeded
    }

    pub fn repairs(&self) -> u8 {
        u8::from(self.repaired)
    }
}
