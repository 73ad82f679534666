use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::attempt::Attempt;
use crate::domain::job::{ExpectedResult, JobId};

const UNKNOWN_REASON: &str = "unknown failure";

/// Collapse whitespace (including newlines) so the text fits a single
/// status-table line. Never returns an empty string.
pub fn single_line(text: &str) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        UNKNOWN_REASON.to_string()
    } else {
        joined
    }
}

/// Arguments handed to the external validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub output_path: PathBuf,
    pub expected_valid: Option<bool>,
    pub expected_count: Option<u32>,
    pub strict_rounding: bool,
}

impl ValidationRequest {
    pub fn new(output_path: impl Into<PathBuf>, expected: &ExpectedResult) -> Self {
        Self {
            output_path: output_path.into(),
            expected_valid: expected.expected_valid,
            expected_count: expected.expected_count,
            strict_rounding: expected.strict_rounding,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

impl ValidationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn fail(diagnostics: Vec<String>) -> Self {
        Self {
            passed: false,
            diagnostics,
        }
    }

    /// First diagnostic line, or a generic message.
    pub fn summary(&self) -> String {
        match self.diagnostics.first() {
            Some(first) if self.diagnostics.len() > 1 => single_line(&format!(
                "{} (+{} more)",
                first,
                self.diagnostics.len() - 1
            )),
            Some(first) => single_line(first),
            None if self.passed => "validation passed".to_string(),
            None => "validation failed".to_string(),
        }
    }
}

/// Persisted once per terminally failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: JobId,
    pub attempts: u8,
    pub reason: String,
    pub last_artifact: Option<PathBuf>,
    pub output_path: PathBuf,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        job_id: JobId,
        attempts: u8,
        reason: &str,
        last_artifact: Option<PathBuf>,
        output_path: PathBuf,
    ) -> Self {
        Self {
            job_id,
            attempts,
            reason: single_line(reason),
            last_artifact,
            output_path,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Terminal result of a job after the retry policy has run its course.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u8,
    pub repairs: u8,
    pub reason: Option<String>,
    pub artifact: Option<PathBuf>,
    pub failure: Option<FailureRecord>,
}

impl JobOutcome {
    pub fn succeeded(last: &Attempt, repairs: u8, artifact: PathBuf) -> Self {
        Self {
            job_id: last.job_id.clone(),
            status: JobStatus::Succeeded,
            attempts: last.number.get(),
            repairs,
            reason: None,
            artifact: Some(artifact),
            failure: None,
        }
    }

    pub fn failed(record: FailureRecord, repairs: u8) -> Self {
        Self {
            job_id: record.job_id.clone(),
            status: JobStatus::Failed,
            attempts: record.attempts,
            repairs,
            reason: Some(record.reason.clone()),
            artifact: None,
            failure: Some(record),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}
