use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, VcsError};
use crate::traits::{VersionControl, Workspace};

pub struct GitVcs {
    repo_path: PathBuf,
}

impl GitVcs {
    pub fn new(repo_path: PathBuf) -> Self {
        Self { repo_path }
    }

    /// Locate the repository containing `cwd` (`git rev-parse --show-toplevel`).
    pub async fn discover(cwd: &Path) -> Result<Self> {
        let output = Command::new("git")
            .arg("-C")
            .arg(cwd)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .await
            .map_err(|e| VcsError::CommandNotFound(format!("git: {}", e)))?;

        if !output.status.success() {
            return Err(VcsError::NotInitialized(cwd.display().to_string()));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self::new(PathBuf::from(root)))
    }

    async fn run_git(&self, args: &[&str], cwd: &Path) -> Result<String> {
        debug!(?args, cwd = %cwd.display(), "git");

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VcsError::CommandFailed(format!(
                "`git {}`: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn path_arg(path: &Path) -> Result<&str> {
        path.to_str()
            .ok_or_else(|| VcsError::InvalidPath(path.display().to_string()))
    }

    fn parse_worktree_list(output: &str, main: &Path) -> Vec<Workspace> {
        let mut workspaces = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;

        let mut flush = |path: Option<PathBuf>, branch: Option<String>| {
            if let (Some(path), Some(branch)) = (path, branch) {
                if path != main {
                    let key = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    workspaces.push(Workspace::new(key, path, branch));
                }
            }
        };

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                flush(current_path.take(), current_branch.take());
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                current_branch = Some(branch.to_string());
            } else if line.is_empty() {
                flush(current_path.take(), current_branch.take());
            }
        }
        flush(current_path, current_branch);

        workspaces
    }
}

#[async_trait]
impl VersionControl for GitVcs {
    fn name(&self) -> &'static str {
        "git"
    }

    fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    async fn is_available(&self) -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn is_initialized(&self) -> Result<bool> {
        if !self.repo_path.is_dir() {
            return Ok(false);
        }
        match self
            .run_git(&["rev-parse", "--is-inside-work-tree"], &self.repo_path)
            .await
        {
            Ok(out) => Ok(out.trim() == "true"),
            Err(VcsError::CommandFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_workspace(
        &self,
        path: &Path,
        branch: &str,
        base_ref: &str,
    ) -> Result<Workspace> {
        if path.exists() {
            return Err(VcsError::WorkspaceAlreadyExists(path.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.run_git(
            &["worktree", "add", "-b", branch, Self::path_arg(path)?, base_ref],
            &self.repo_path,
        )
        .await?;

        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| branch.to_string());
        Ok(Workspace::new(key, path.to_path_buf(), branch))
    }

    async fn cleanup_workspace(&self, workspace: &Workspace) -> Result<()> {
        if let Err(e) = self
            .run_git(
                &[
                    "worktree",
                    "remove",
                    "--force",
                    Self::path_arg(&workspace.path)?,
                ],
                &self.repo_path,
            )
            .await
        {
            debug!(workspace = %workspace.key, error = %e, "worktree remove skipped");
        }

        if let Err(e) = self
            .run_git(&["branch", "-D", &workspace.branch_name], &self.repo_path)
            .await
        {
            debug!(branch = %workspace.branch_name, error = %e, "branch delete skipped");
        }

        if workspace.path.exists() {
            tokio::fs::remove_dir_all(&workspace.path).await?;
        }

        if let Err(e) = self.run_git(&["worktree", "prune"], &self.repo_path).await {
            warn!(error = %e, "git worktree prune failed");
        }

        Ok(())
    }

    async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let output = self
            .run_git(&["worktree", "list", "--porcelain"], &self.repo_path)
            .await?;

        Ok(Self::parse_worktree_list(&output, &self.repo_path))
    }

    async fn staged_files(&self) -> Result<Vec<String>> {
        // A rename must list its source too, or a move into an allowed
        // directory hides the deletion outside it.
        let output = self
            .run_git(
                &["diff", "--cached", "--name-only", "--no-renames"],
                &self.repo_path,
            )
            .await?;

        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn stage(&self, pathspec: &Path) -> Result<()> {
        let result = self
            .run_git(&["add", "-A", "--", Self::path_arg(pathspec)?], &self.repo_path)
            .await;

        match result {
            Ok(_) => Ok(()),
            // Nothing on disk and nothing tracked: there is nothing to stage.
            Err(VcsError::CommandFailed(_)) if !self.repo_path.join(pathspec).exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn commit(&self, message: &str) -> Result<String> {
        self.run_git(&["commit", "-m", message], &self.repo_path)
            .await?;

        let output = self
            .run_git(&["rev-parse", "HEAD"], &self.repo_path)
            .await?;

        Ok(output.trim().to_string())
    }

    async fn current_branch(&self) -> Result<Option<String>> {
        let output = self
            .run_git(&["rev-parse", "--abbrev-ref", "HEAD"], &self.repo_path)
            .await?;
        let branch = output.trim();

        if branch.is_empty() || branch == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(branch.to_string()))
        }
    }

    async fn has_remote(&self, remote: &str) -> Result<bool> {
        match self
            .run_git(&["remote", "get-url", remote], &self.repo_path)
            .await
        {
            Ok(_) => Ok(true),
            Err(VcsError::CommandFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_git(&["push", remote, branch], &self.repo_path)
            .await?;

        Ok(())
    }
}
