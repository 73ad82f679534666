//! Job enumeration.
//!
//! Jobs come either from a directory (one job per immediate subdirectory)
//! or from a manifest file (JSON or TOML) that can also carry the
//! expected-result metadata for the validator.

use isobatch_core::{ExpectedResult, Job, JobId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use vcs::paths::relative_to;

use crate::error::{OrchestratorError, Result};

/// Name of the failure log inside the output directory.
pub const FAILURE_LOG_NAME: &str = "failures.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSource {
    Directory(PathBuf),
    Manifest(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    jobs: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    id: String,
    source: PathBuf,
    #[serde(default)]
    output_name: Option<String>,
    #[serde(flatten)]
    expected: ExpectedResult,
}

impl JobSource {
    /// A file is read as a manifest, anything else as a job directory.
    pub fn detect(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_file() {
            Self::Manifest(path)
        } else {
            Self::Directory(path)
        }
    }

    /// Enumerate jobs with sources expressed relative to `repo_root`.
    pub async fn load(&self, repo_root: &Path) -> Result<Vec<Job>> {
        let jobs = match self {
            Self::Directory(dir) => discover_directory(repo_root, &absolute(repo_root, dir)).await?,
            Self::Manifest(path) => load_manifest(repo_root, &absolute(repo_root, path)).await?,
        };
        validate_jobs(&jobs)?;
        info!(count = jobs.len(), "Jobs enumerated");
        Ok(jobs)
    }
}

fn absolute(repo_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}

async fn discover_directory(repo_root: &Path, dir: &Path) -> Result<Vec<Job>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        OrchestratorError::InvalidConfig(format!("cannot read job directory {}: {}", dir.display(), e))
    })?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type().await?.is_dir() {
            continue;
        }
        names.push(name);
    }
    names.sort();

    names
        .into_iter()
        .map(|name| -> Result<Job> {
            let source = relative_to(repo_root, &dir.join(&name))?;
            debug!(job = %name, source = %source.display(), "Discovered job");
            Ok(Job::new(JobId::slugify(&name), source))
        })
        .collect()
}

async fn load_manifest(repo_root: &Path, path: &Path) -> Result<Vec<Job>> {
    let content = tokio::fs::read_to_string(path).await?;
    let manifest = parse_manifest(path, &content)?;

    manifest
        .jobs
        .into_iter()
        .map(|entry| -> Result<Job> {
            let id = JobId::parse(&entry.id)
                .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
            let source = relative_to(repo_root, &absolute(repo_root, &entry.source))?;
            let mut job = Job::new(id, source).with_expected(entry.expected);
            if let Some(name) = entry.output_name {
                job = job.with_output_name(name);
            }
            Ok(job)
        })
        .collect()
}

fn parse_manifest(path: &Path, content: &str) -> Result<Manifest> {
    let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
    if is_toml {
        toml::from_str(content).map_err(|e| OrchestratorError::Serialization(e.to_string()))
    } else {
        Ok(serde_json::from_str(content)?)
    }
}

/// Ids must be unique and every job must write a distinct plain file name.
pub fn validate_jobs(jobs: &[Job]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut outputs = HashSet::new();

    for job in jobs {
        if !ids.insert(job.id.as_str()) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "duplicate job id: {}",
                job.id
            )));
        }

        let mut components = Path::new(&job.output_name).components();
        let plain = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !plain || job.output_name == FAILURE_LOG_NAME {
            return Err(OrchestratorError::InvalidConfig(format!(
                "job {} has an unusable output name: {:?}",
                job.id, job.output_name
            )));
        }
        if !outputs.insert(job.output_name.as_str()) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "output name {} is used by more than one job",
                job.output_name
            )));
        }
    }
    Ok(())
}
