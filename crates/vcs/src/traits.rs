use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// An isolated checkout of the shared repository on its own branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    /// Directory name of the checkout, unique per job attempt.
    pub key: String,
    pub path: PathBuf,
    pub branch_name: String,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(key: impl Into<String>, path: PathBuf, branch_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            path,
            branch_name: branch_name.into(),
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Reclaimed,
}

/// Git operations the allocator and checkpoint publisher rely on.
#[async_trait]
pub trait VersionControl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Root of the shared working copy
    fn repo_path(&self) -> &Path;

    /// Whether the backend binary can be executed.
    async fn is_available(&self) -> bool;

    /// Whether `repo_path` is inside a repository.
    async fn is_initialized(&self) -> Result<bool>;

    /// Create an isolated checkout at `path` on a new branch off `base_ref`
    async fn create_workspace(&self, path: &Path, branch: &str, base_ref: &str)
        -> Result<Workspace>;

    /// Remove a checkout and its branch. Must succeed when already removed.
    async fn cleanup_workspace(&self, workspace: &Workspace) -> Result<()>;

    /// List all checkouts other than the main one
    async fn list_workspaces(&self) -> Result<Vec<Workspace>>;

    /// Paths currently staged in the shared working copy. A rename lists
    /// both its source and destination.
    async fn staged_files(&self) -> Result<Vec<String>>;

    /// Stage every change (including deletions) under `pathspec`
    async fn stage(&self, pathspec: &Path) -> Result<()>;

    /// Commit the staged changes and return the new revision
    async fn commit(&self, message: &str) -> Result<String>;

    /// Current branch, or `None` on a detached HEAD
    async fn current_branch(&self) -> Result<Option<String>>;

    /// Check whether a remote is configured
    async fn has_remote(&self, remote: &str) -> Result<bool>;

    /// Push `branch` to `remote`
    async fn push(&self, remote: &str, branch: &str) -> Result<()>;
}
