use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::error::{CoreError, Result};

const FALLBACK_SLUG: &str = "job";

fn disallowed_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("static pattern"))
}

fn repeated_dots() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\.{2,}").expect("static pattern"))
}

/// Identifier of one job. Always a filesystem and branch-name safe slug.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Build an id from arbitrary text, replacing anything outside
    /// `[A-Za-z0-9._-]` with `-`. Runs of dots become one, since git
    /// refuses `..` in branch names.
    pub fn slugify(raw: &str) -> Self {
        let cleaned = disallowed_chars().replace_all(raw.trim(), "-");
        let cleaned = repeated_dots().replace_all(&cleaned, ".");
        let trimmed = cleaned.trim_matches(|c| c == '-' || c == '_' || c == '.');
        if trimmed.is_empty() {
            Self(FALLBACK_SLUG.to_string())
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Accept an id only if it is already a clean slug.
    pub fn parse(raw: &str) -> Result<Self> {
        let slug = Self::slugify(raw);
        if slug.0 == raw {
            Ok(slug)
        } else {
            Err(CoreError::InvalidJobId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the validator should expect from a job's artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<u32>,
    #[serde(default)]
    pub strict_rounding: bool,
}

/// One unit of work. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub source: PathBuf,
    pub output_name: String,
    #[serde(default)]
    pub expected: ExpectedResult,
}

impl Job {
    pub fn new(id: JobId, source: impl Into<PathBuf>) -> Self {
        let output_name = format!("{}.json", id);
        Self {
            id,
            source: source.into(),
            output_name,
            expected: ExpectedResult::default(),
        }
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    pub fn with_expected(mut self, expected: ExpectedResult) -> Self {
        self.expected = expected;
        self
    }
}
