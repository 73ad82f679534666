use anyhow::{Context, Result};
use orchestrator::{OrchestratorConfig, WorkerCommands};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".isobatch";
pub const CONFIG_FILE: &str = "config.toml";

/// Contents of `.isobatch/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsobatchConfig {
    pub jobs: JobsConfig,
    pub orchestrator: OrchestratorConfig,
    pub commands: WorkerCommands,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Directory with one subdirectory per job, or a JSON/TOML manifest.
    pub source: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bwrap: Option<PathBuf>,
    pub share_network: bool,
    /// Host directories bound read-only; the built-in list when unset.
    /// Entries containing the repository are skipped either way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_paths: Option<Vec<PathBuf>>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("jobs"),
        }
    }
}

impl Default for IsobatchConfig {
    fn default() -> Self {
        Self {
            jobs: JobsConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            commands: WorkerCommands {
                extract: vec!["./tools/extract.sh".to_string()],
                repair: None,
                validate: vec!["./tools/validate.sh".to_string()],
            },
            sandbox: SandboxConfig::default(),
        }
    }
}

impl IsobatchConfig {
    pub fn path(repo: &Path) -> PathBuf {
        repo.join(STATE_DIR).join(CONFIG_FILE)
    }

    /// Read the repository's config, falling back to defaults when absent.
    pub async fn load(repo: &Path) -> Result<Self> {
        let path = Self::path(repo);
        let mut config: Self = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.orchestrator.repo_path = repo.to_path_buf();
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
