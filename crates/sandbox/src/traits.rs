use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::policy::SandboxPolicy;

/// Program, arguments and extra environment for one sandboxed process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SandboxCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Split a configured command line (`python3 tools/validate.py`) into
    /// program and leading arguments.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, rest) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: rest.to_vec(),
            env: Vec::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Last `lines` non-empty lines of stderr, falling back to stdout.
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let kept: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = kept.len().saturating_sub(lines);
        kept[start..].join("\n")
    }
}

/// A running sandboxed process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    label: String,
}

impl ProcessHandle {
    /// Spawn `command` with captured output. Sandbox implementations build
    /// the fully wrapped command and hand it here.
    pub fn spawn(mut command: Command, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn()?;
        debug!(process = %label, pid = ?child.id(), "Spawned sandboxed process");
        Ok(Self { child, label })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the process to exit. There is no timeout: a process runs as
    /// long as it needs to.
    pub async fn wait(self) -> Result<ProcessOutput> {
        let output = self
            .child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::Process(format!("{}: {}", self.label, e)))?;

        debug!(process = %self.label, status = %output.status, "Sandboxed process exited");
        Ok(ProcessOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// An OS-level isolation mechanism for worker processes.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the isolation mechanism can be established on this host.
    async fn is_available(&self) -> bool;

    /// Start `command` confined to `policy`. Must fail rather than run the
    /// command unconfined.
    async fn launch(&self, policy: &SandboxPolicy, command: &SandboxCommand)
        -> Result<ProcessHandle>;

    /// Launch and wait for completion.
    async fn run(&self, policy: &SandboxPolicy, command: &SandboxCommand) -> Result<ProcessOutput> {
        self.launch(policy, command).await?.wait().await
    }
}
