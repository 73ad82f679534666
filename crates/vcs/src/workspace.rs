use isobatch_core::{AttemptNumber, Job, JobId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, VcsError};
use crate::paths::{copy_tree, relative_to, resolve_under};
use crate::traits::{VersionControl, Workspace, WorkspaceStatus};

/// Serializes operations that mutate shared repository metadata
/// (worktree creation/removal, checkpoint commits).
pub type RepoLock = Arc<Mutex<()>>;

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Where worktrees are created, relative to the repository root.
    pub worktrees_root: PathBuf,
    pub branch_prefix: String,
    pub base_ref: String,
    /// Worker-local output root inside each worktree.
    pub output_root: PathBuf,
    /// Repository-relative paths copied into every worktree and exposed
    /// read-only to the worker (tool scripts, reference material).
    pub read_only_resources: Vec<PathBuf>,
    /// Distinguishes worktrees of one orchestration run from another.
    pub run_token: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            worktrees_root: PathBuf::from(".isobatch/worktrees"),
            branch_prefix: "isobatch-worker".to_string(),
            base_ref: "HEAD".to_string(),
            output_root: PathBuf::from("tmp"),
            read_only_resources: Vec::new(),
            run_token: "run".to_string(),
        }
    }
}

impl WorkspaceConfig {
    pub fn new(worktrees_root: PathBuf) -> Self {
        Self {
            worktrees_root,
            ..Default::default()
        }
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = base_ref.into();
        self
    }

    pub fn with_read_only_resources(mut self, resources: Vec<PathBuf>) -> Self {
        self.read_only_resources = resources;
        self
    }

    pub fn with_run_token(mut self, token: impl Into<String>) -> Self {
        self.run_token = token.into();
        self
    }

    fn key_for(&self, job_id: &JobId, attempt: AttemptNumber) -> String {
        format!("{}-a{}-{}", job_id, attempt.get(), self.run_token)
    }
}

/// A worktree bound to exactly one job attempt, plus the filesystem
/// allow-lists the sandbox derives from it.
#[derive(Debug, Clone)]
pub struct JobWorkspace {
    pub job_id: JobId,
    pub attempt: AttemptNumber,
    pub workspace: Workspace,
    /// The job's source, copied into the worktree.
    pub source_dir: PathBuf,
    /// Worker-local output directory.
    pub output_dir: PathBuf,
    /// Where the worker must write its artifact.
    pub output_path: PathBuf,
    pub read_only: Vec<PathBuf>,
    pub read_write: Vec<PathBuf>,
}

impl JobWorkspace {
    pub fn path(&self) -> &Path {
        &self.workspace.path
    }

    pub fn is_active(&self) -> bool {
        self.workspace.status == WorkspaceStatus::Active
    }
}

pub struct WorkspaceAllocator {
    vcs: Arc<dyn VersionControl>,
    config: WorkspaceConfig,
    lock: RepoLock,
}

impl WorkspaceAllocator {
    pub fn new(vcs: Arc<dyn VersionControl>, config: WorkspaceConfig) -> Self {
        Self {
            vcs,
            config,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Lock shared with anything else that writes repository metadata.
    pub fn repo_lock(&self) -> RepoLock {
        Arc::clone(&self.lock)
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Get a reference to the underlying VCS implementation
    pub fn vcs(&self) -> &dyn VersionControl {
        self.vcs.as_ref()
    }

    /// Create a fresh worktree for one attempt of `job`.
    pub async fn allocate(&self, job: &Job, attempt: AttemptNumber) -> Result<JobWorkspace> {
        let repo_root = self.vcs.repo_path().to_path_buf();
        let _guard = self.lock.lock().await;

        if !self.vcs.is_initialized().await? {
            return Err(VcsError::NotInitialized(repo_root.display().to_string()));
        }

        let key = self.config.key_for(&job.id, attempt);
        let worktrees_root = resolve_under(&repo_root, &self.config.worktrees_root)?;
        let path = worktrees_root.join(&key);
        if path.exists() {
            return Err(VcsError::WorkspaceAlreadyExists(path.display().to_string()));
        }

        let branch = format!("{}/{}", self.config.branch_prefix, key);
        info!(job_id = %job.id, attempt = attempt.get(), path = %path.display(), "Allocating workspace");

        let workspace = self
            .vcs
            .create_workspace(&path, &branch, &self.config.base_ref)
            .await?;

        match self.prepare_payload(&repo_root, job, attempt, workspace.clone()).await {
            Ok(allocated) => {
                debug!(
                    job_id = %job.id,
                    read_only = allocated.read_only.len(),
                    read_write = allocated.read_write.len(),
                    "Workspace ready"
                );
                Ok(allocated)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Payload preparation failed, removing workspace");
                if let Err(cleanup) = self.vcs.cleanup_workspace(&workspace).await {
                    warn!(error = %cleanup, "Rollback of failed workspace also failed");
                }
                Err(e)
            }
        }
    }

    async fn prepare_payload(
        &self,
        repo_root: &Path,
        job: &Job,
        attempt: AttemptNumber,
        workspace: Workspace,
    ) -> Result<JobWorkspace> {
        let source_rel = relative_to(repo_root, &job.source)?;
        let source_abs = repo_root.join(&source_rel);
        if !source_abs.exists() {
            return Err(VcsError::InvalidPath(format!(
                "job source not found: {}",
                source_abs.display()
            )));
        }

        let mut copies = vec![(source_abs, resolve_under(&workspace.path, &source_rel)?)];
        let mut read_only = Vec::new();
        for resource in &self.config.read_only_resources {
            let rel = relative_to(repo_root, resource)?;
            let dst = resolve_under(&workspace.path, &rel)?;
            copies.push((repo_root.join(&rel), dst.clone()));
            read_only.push(dst);
        }

        let output_dir =
            resolve_under(&workspace.path, &self.config.output_root.join(job.id.as_str()))?;
        let output_path = resolve_under(&output_dir, Path::new(&job.output_name))?;
        let source_dir = copies[0].1.clone();

        let dirs = output_dir.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            for (src, dst) in &copies {
                copy_tree(src, dst)?;
            }
            std::fs::create_dir_all(&dirs)
        })
        .await
        .map_err(|e| VcsError::Payload(e.to_string()))?
        .map_err(|e| VcsError::Payload(e.to_string()))?;

        Ok(JobWorkspace {
            job_id: job.id.clone(),
            attempt,
            workspace,
            read_write: vec![source_dir.clone(), output_dir.clone()],
            source_dir,
            output_dir,
            output_path,
            read_only,
        })
    }

    /// Remove the worktree and its branch. Safe to call more than once.
    pub async fn reclaim(&self, allocated: &mut JobWorkspace) -> Result<()> {
        let _guard = self.lock.lock().await;

        if allocated.is_active() {
            info!(job_id = %allocated.job_id, attempt = allocated.attempt.get(), "Reclaiming workspace");
        }
        self.vcs.cleanup_workspace(&allocated.workspace).await?;
        allocated.workspace.status = WorkspaceStatus::Reclaimed;
        Ok(())
    }

    /// Worktrees left behind by earlier runs (matched by branch prefix).
    pub async fn list_stale(&self) -> Result<Vec<Workspace>> {
        let prefix = format!("{}/", self.config.branch_prefix);
        Ok(self
            .vcs
            .list_workspaces()
            .await?
            .into_iter()
            .filter(|ws| ws.branch_name.starts_with(&prefix))
            .collect())
    }

    pub async fn reclaim_stale(&self) -> Result<Vec<Workspace>> {
        let stale = self.list_stale().await?;
        let _guard = self.lock.lock().await;
        for workspace in &stale {
            info!(workspace = %workspace.key, "Removing stale workspace");
            self.vcs.cleanup_workspace(workspace).await?;
        }
        Ok(stale)
    }
}
