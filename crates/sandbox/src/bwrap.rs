use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::policy::SandboxPolicy;
use crate::traits::{ProcessHandle, Sandbox, SandboxCommand};

/// Host directories every process needs to run at all. Bound read-only
/// when present.
pub const SYSTEM_RO_PATHS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc", "/opt"];

/// Sandbox backed by bubblewrap (`bwrap`).
pub struct BubblewrapSandbox {
    binary: Option<PathBuf>,
    share_network: bool,
    system_paths: Vec<PathBuf>,
    /// System entries at or above any of these are never bound.
    protected: Vec<PathBuf>,
}

impl BubblewrapSandbox {
    /// Locate `bwrap` on `PATH`.
    pub fn new() -> Self {
        Self::from_binary(which::which("bwrap").ok())
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self::from_binary(Some(binary))
    }

    fn from_binary(binary: Option<PathBuf>) -> Self {
        Self {
            binary,
            share_network: true,
            system_paths: SYSTEM_RO_PATHS.iter().map(PathBuf::from).collect(),
            protected: Vec::new(),
        }
    }

    pub fn with_network(mut self, share: bool) -> Self {
        self.share_network = share;
        self
    }

    /// Replace the host directories bound read-only into every sandbox.
    pub fn with_system_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_paths = paths;
        self
    }

    /// Keep `root` (typically the shared repository) out of the system
    /// binds. Allow-list entries beneath it are still bound.
    pub fn protect(mut self, root: PathBuf) -> Self {
        self.protected.push(root);
        self
    }

    fn system_binds(&self) -> impl Iterator<Item = &Path> {
        self.system_paths
            .iter()
            .map(PathBuf::as_path)
            .filter(|path| path.exists())
            .filter(move |path| {
                let covers = self.protected.iter().any(|root| root.starts_with(path));
                if covers {
                    debug!(path = %path.display(), "Skipping system bind over a protected root");
                }
                !covers
            })
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    fn require_binary(&self) -> Result<&Path> {
        self.binary
            .as_deref()
            .ok_or_else(|| SandboxError::Unavailable("bubblewrap (bwrap) not found in PATH".into()))
    }

    /// Full `bwrap` argument list for `command` under `policy`.
    pub fn build_args(&self, policy: &SandboxPolicy, command: &SandboxCommand) -> Vec<String> {
        let mut args: Vec<String> = [
            "--die-with-parent",
            "--new-session",
            "--unshare-all",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if self.share_network {
            args.push("--share-net".into());
        }
        args.extend(
            ["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"]
                .iter()
                .map(|s| s.to_string()),
        );

        for path in self.system_binds() {
            push_bind(&mut args, "--ro-bind", path);
        }
        for path in &policy.read_only {
            push_bind(&mut args, "--ro-bind", path);
        }
        // Writable entries come last so they win over an enclosing read-only bind.
        for path in &policy.read_write {
            push_bind(&mut args, "--bind", path);
        }

        for (key, value) in [("HOME", "/tmp"), ("ISOBATCH_SANDBOX", "1")] {
            args.extend(["--setenv".to_string(), key.to_string(), value.to_string()]);
        }
        for (key, value) in &command.env {
            args.extend(["--setenv".to_string(), key.clone(), value.clone()]);
        }

        args.push("--chdir".into());
        args.push(policy.cwd.display().to_string());
        args.push("--".into());
        args.push(command.program.clone());
        args.extend(command.args.iter().cloned());
        args
    }
}

impl Default for BubblewrapSandbox {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bind(args: &mut Vec<String>, flag: &str, path: &Path) {
    let p = path.display().to_string();
    args.push(flag.to_string());
    args.push(p.clone());
    args.push(p);
}

#[async_trait]
impl Sandbox for BubblewrapSandbox {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    async fn is_available(&self) -> bool {
        let Some(binary) = self.binary.as_deref() else {
            return false;
        };

        // Namespaces may be disabled even when the binary exists.
        let probe = Command::new(binary)
            .args(["--die-with-parent", "--unshare-all", "--ro-bind", "/", "/", "true"])
            .output()
            .await;

        match probe {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "bubblewrap probe failed"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "bubblewrap probe could not start");
                false
            }
        }
    }

    async fn launch(
        &self,
        policy: &SandboxPolicy,
        command: &SandboxCommand,
    ) -> Result<ProcessHandle> {
        let binary = self.require_binary()?;
        policy.validate()?;

        let args = self.build_args(policy, command);
        debug!(
            program = %command.program,
            read_only = policy.read_only.len(),
            read_write = policy.read_write.len(),
            "Launching bubblewrap sandbox"
        );

        let mut cmd = Command::new(binary);
        cmd.args(&args).env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        ProcessHandle::spawn(cmd, &command.program).map_err(|e| match e {
            SandboxError::Io(io) => SandboxError::Unavailable(format!("bwrap spawn failed: {}", io)),
            other => other,
        })
    }
}
