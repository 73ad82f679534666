use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use vcs::paths::resolve_under;
use vcs::WorkspaceConfig;

use crate::error::{OrchestratorError, Result};

pub const DEFAULT_COMMIT_MESSAGE: &str = "isobatch: processed {count} jobs";

/// Run-level settings. Paths are relative to the repository root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(skip)]
    pub repo_path: PathBuf,
    pub output_dir: PathBuf,
    /// Orchestrator-private state (checkpoint counter, quarantine).
    pub state_dir: PathBuf,
    pub concurrency: usize,
    pub commit_every: u32,
    pub publish_every: u32,
    pub max_attempts: u8,
    pub remote: String,
    /// Branch to push; the current branch when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub commit_message: String,
    pub worktrees_root: PathBuf,
    pub branch_prefix: String,
    pub base_ref: String,
    pub read_only_resources: Vec<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let workspace = WorkspaceConfig::default();
        Self {
            repo_path: PathBuf::from("."),
            output_dir: PathBuf::from("output"),
            state_dir: PathBuf::from(".isobatch"),
            concurrency: 3,
            commit_every: 10,
            publish_every: 20,
            max_attempts: 2,
            remote: "origin".to_string(),
            branch: None,
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
            worktrees_root: workspace.worktrees_root,
            branch_prefix: workspace.branch_prefix,
            base_ref: workspace.base_ref,
            read_only_resources: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            ..Default::default()
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_concurrency(mut self, cap: usize) -> Self {
        self.concurrency = cap;
        self
    }

    pub fn with_thresholds(mut self, commit_every: u32, publish_every: u32) -> Self {
        self.commit_every = commit_every;
        self.publish_every = publish_every;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u8) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>, branch: Option<String>) -> Self {
        self.remote = remote.into();
        self.branch = branch;
        self
    }

    pub fn with_read_only_resources(mut self, resources: Vec<PathBuf>) -> Self {
        self.read_only_resources = resources;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be greater than zero"));
        }
        if self.commit_every == 0 {
            return Err(invalid("commit_every must be greater than zero"));
        }
        if self.publish_every == 0 || self.publish_every % self.commit_every != 0 {
            return Err(invalid(format!(
                "publish_every ({}) must be a positive multiple of commit_every ({})",
                self.publish_every, self.commit_every
            )));
        }
        if !(1..=2).contains(&self.max_attempts) {
            return Err(invalid(format!(
                "max_attempts must be 1 or 2, got {}",
                self.max_attempts
            )));
        }
        if self.commit_message.trim().is_empty() {
            return Err(invalid("commit_message must not be empty"));
        }

        for (label, path) in [
            ("output_dir", &self.output_dir),
            ("state_dir", &self.state_dir),
            ("worktrees_root", &self.worktrees_root),
        ] {
            check_confined(label, path)?;
        }
        for resource in &self.read_only_resources {
            check_confined("read_only_resources", resource)?;
        }

        let output = self.output_rel();
        if normalized(&self.worktrees_root).starts_with(&output) {
            return Err(invalid("worktrees_root must not live inside output_dir"));
        }
        if normalized(&self.state_dir).starts_with(&output) {
            return Err(invalid("state_dir must not live inside output_dir"));
        }
        Ok(())
    }

    pub fn concurrency_cap(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.concurrency)
            .ok_or_else(|| invalid("concurrency must be greater than zero"))
    }

    /// `output_dir` with `.` and `..` folded away, in the form git reports
    /// repository paths.
    pub fn output_rel(&self) -> PathBuf {
        normalized(&self.output_dir)
    }

    pub fn output_dir_abs(&self) -> PathBuf {
        self.repo_path.join(self.output_rel())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.repo_path.join(&self.state_dir).join("checkpoint.json")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.repo_path.join(&self.state_dir).join("quarantine")
    }

    /// Scratch space for files on their way into the output directory.
    pub fn staging_dir(&self) -> PathBuf {
        self.repo_path.join(&self.state_dir).join("staging")
    }

    pub fn workspace_config(&self, run_token: &str) -> WorkspaceConfig {
        WorkspaceConfig::new(self.worktrees_root.clone())
            .with_branch_prefix(self.branch_prefix.clone())
            .with_base_ref(self.base_ref.clone())
            .with_read_only_resources(self.read_only_resources.clone())
            .with_run_token(run_token)
    }
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidConfig(message.into())
}

/// Paths that fail to resolve are returned as given; `validate` rejects them.
fn normalized(path: &Path) -> PathBuf {
    resolve_under(Path::new(""), path).unwrap_or_else(|_| path.to_path_buf())
}

/// Relative, non-empty and unable to climb out of the repository.
fn check_confined(label: &str, path: &Path) -> Result<()> {
    let resolved = resolve_under(Path::new("/"), path)
        .map_err(|e| invalid(format!("{}: {}", label, e)))?;
    if resolved.components().all(|c| !matches!(c, Component::Normal(_))) {
        return Err(invalid(format!("{} must name a directory: {:?}", label, path)));
    }
    Ok(())
}
