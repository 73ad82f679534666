//! The shared output area.
//!
//! Workers never write here. Validated artifacts are copied in by the
//! orchestrator, and the failure log is rewritten as a whole under a lock so
//! concurrent completions cannot interleave. Checkpoint commits stage this
//! directory without that lock, so every file is written in the staging
//! directory first and only renamed in once complete.

use isobatch_core::{AttemptNumber, FailureRecord, Job, JobId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vcs::paths::resolve_under;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::jobs::FAILURE_LOG_NAME;

pub type FailureLog = BTreeMap<JobId, FailureRecord>;

pub struct OutputStore {
    output_dir: PathBuf,
    quarantine_dir: PathBuf,
    /// Must lie outside `output_dir`.
    staging_dir: PathBuf,
    lock: Mutex<()>,
}

impl OutputStore {
    pub fn new(output_dir: PathBuf, quarantine_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            output_dir,
            quarantine_dir,
            staging_dir,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.output_dir_abs(),
            config.quarantine_dir(),
            config.staging_dir(),
        )
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn failures_path(&self) -> PathBuf {
        self.output_dir.join(FAILURE_LOG_NAME)
    }

    /// Final location of a job's artifact.
    pub fn destination(&self, job: &Job) -> PathBuf {
        self.output_dir.join(&job.output_name)
    }

    /// Copy a validated artifact into the output area and drop any failure
    /// entry left for the job by an earlier run.
    pub async fn publish_artifact(&self, job: &Job, artifact: &Path) -> Result<PathBuf> {
        let destination = resolve_under(&self.output_dir, Path::new(&job.output_name))?;
        let _guard = self.lock.lock().await;

        let staging = self.staging_dir.join(format!("{}.partial", job.id));
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        tokio::fs::copy(artifact, &staging).await?;
        move_into_place(&staging, &destination).await?;
        info!(job_id = %job.id, path = %destination.display(), "Artifact published");

        let mut log = self.read_failures().await?;
        if log.remove(&job.id).is_some() {
            debug!(job_id = %job.id, "Clearing stale failure record");
            self.write_failures(&log).await?;
        }
        Ok(destination)
    }

    /// Insert (or replace) the job's entry in the failure log.
    pub async fn record_failure(&self, record: &FailureRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut log = self.read_failures().await?;
        log.insert(record.job_id.clone(), record.clone());
        self.write_failures(&log).await?;
        warn!(job_id = %record.job_id, attempts = record.attempts, reason = %record.reason, "Failure recorded");
        Ok(())
    }

    pub async fn load_failures(&self) -> Result<FailureLog> {
        let _guard = self.lock.lock().await;
        self.read_failures().await
    }

    /// Keep a failed attempt's artifact after its workspace is reclaimed.
    pub async fn quarantine(
        &self,
        job_id: &JobId,
        attempt: AttemptNumber,
        artifact: &Path,
    ) -> Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(artifact).await.unwrap_or(false) {
            return Ok(None);
        }
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());

        let dir = self.quarantine_dir.join(job_id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(format!("attempt-{}-{}", attempt.get(), file_name));
        tokio::fs::copy(artifact, &target).await?;
        debug!(job_id = %job_id, path = %target.display(), "Artifact quarantined");
        Ok(Some(target))
    }

    async fn read_failures(&self) -> Result<FailureLog> {
        let path = self.failures_path();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Ok(FailureLog::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FailureLog::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_failures(&self, log: &FailureLog) -> Result<()> {
        let path = self.failures_path();
        if log.is_empty() {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_file(&path).await?;
            }
            return Ok(());
        }
        let json = serde_json::to_string_pretty(log)?;
        let tmp = self.staging_dir.join(format!("{}.tmp", FAILURE_LOG_NAME));
        write_staged(&tmp, &path, json.as_bytes()).await
    }
}

/// Write through a sibling temp file and rename over the target.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    write_staged(&path.with_extension("tmp"), path, contents).await
}

async fn write_staged(tmp: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = tmp.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(tmp, contents).await?;
    move_into_place(tmp, path).await
}

/// Rename `staged` onto `path`, removing `staged` when that fails.
async fn move_into_place(staged: &Path, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Err(e) = tokio::fs::rename(staged, path).await {
        let _ = tokio::fs::remove_file(staged).await;
        return Err(e.into());
    }
    Ok(())
}
