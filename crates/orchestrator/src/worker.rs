//! One job attempt inside its workspace.
//!
//! The domain work and the validation procedure are opaque to the
//! orchestrator and reached through [`JobRunner`] and [`Validator`]. The
//! worker drives the attempt state machine around them:
//!
//! ```text
//! running -> validating -> succeeded
//!                       -> repairing -> validating -> succeeded | failed
//! ```

use async_trait::async_trait;
use events::{Event, EventBus};
use isobatch_core::{
    single_line, Attempt, AttemptStatus, Job, ValidationReport, ValidationRequest,
};
use sandbox::{Sandbox, SandboxCommand, SandboxPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vcs::JobWorkspace;

use crate::error::{OrchestratorError, Result};

/// Context handed to the parent-level re-spawn of a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub previous_reason: String,
    pub diagnostics: Vec<String>,
}

impl Correction {
    pub fn from_attempt(attempt: &Attempt) -> Self {
        Self {
            previous_reason: attempt
                .failure_reason
                .clone()
                .unwrap_or_else(|| single_line("")),
            diagnostics: attempt
                .validation
                .as_ref()
                .map(|v| v.diagnostics.clone())
                .unwrap_or_default(),
        }
    }

    /// One-line form passed to worker commands.
    pub fn render(&self) -> String {
        if self.diagnostics.is_empty() {
            self.previous_reason.clone()
        } else {
            single_line(&format!(
                "{}; {}",
                self.previous_reason,
                self.diagnostics.join("; ")
            ))
        }
    }
}

/// Everything a collaborator may know about the attempt it serves.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    pub job: &'a Job,
    pub workspace: &'a JobWorkspace,
    pub correction: Option<&'a Correction>,
}

impl<'a> WorkerContext<'a> {
    pub fn validation_request(&self) -> ValidationRequest {
        ValidationRequest::new(self.workspace.output_path.clone(), &self.job.expected)
    }

    /// Writable paths for the worker, read-only resources as configured.
    pub fn worker_policy(&self) -> SandboxPolicy {
        SandboxPolicy::new(self.workspace.path())
            .with_read_only(self.workspace.read_only.iter().cloned())
            .with_read_write(self.workspace.read_write.iter().cloned())
    }

    /// Same view as the worker but nothing is writable.
    pub fn validator_policy(&self) -> SandboxPolicy {
        SandboxPolicy::new(self.workspace.path()).with_read_only(
            self.workspace
                .read_only
                .iter()
                .chain(self.workspace.read_write.iter())
                .cloned(),
        )
    }

    fn env(&self) -> Vec<(String, String)> {
        let ws = self.workspace;
        let mut env = vec![
            ("ISOBATCH_JOB_ID".to_string(), self.job.id.to_string()),
            ("ISOBATCH_SOURCE_DIR".to_string(), ws.source_dir.display().to_string()),
            ("ISOBATCH_OUTPUT_PATH".to_string(), ws.output_path.display().to_string()),
            ("ISOBATCH_OUTPUT_DIR".to_string(), ws.output_dir.display().to_string()),
            ("ISOBATCH_ATTEMPT".to_string(), ws.attempt.get().to_string()),
            ("ISOBATCH_WORKSPACE".to_string(), ws.path().display().to_string()),
        ];
        if let Some(correction) = self.correction {
            env.push(("ISOBATCH_CORRECTION".to_string(), correction.render()));
        }
        env
    }
}

/// The domain work of a job. Must write the artifact to
/// `workspace.output_path` and nowhere outside the workspace.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn extract(&self, ctx: WorkerContext<'_>) -> Result<()>;

    /// Single deterministic fix-up pass after a failed validation.
    async fn repair(&self, ctx: WorkerContext<'_>, report: &ValidationReport) -> Result<()>;
}

/// Authoritative pass/fail judgement of an artifact.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        ctx: WorkerContext<'_>,
        request: &ValidationRequest,
    ) -> Result<ValidationReport>;
}

pub struct WorkerUnit {
    runner: Arc<dyn JobRunner>,
    validator: Arc<dyn Validator>,
    event_bus: Option<EventBus>,
}

impl WorkerUnit {
    pub fn new(runner: Arc<dyn JobRunner>, validator: Arc<dyn Validator>) -> Self {
        Self {
            runner,
            validator,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Run one attempt to a terminal state. Collaborator failures end up in
    /// the returned attempt; an `Err` means the state machine was violated.
    pub async fn execute(
        &self,
        job: &Job,
        workspace: &JobWorkspace,
        correction: Option<&Correction>,
    ) -> Result<Attempt> {
        let ctx = WorkerContext {
            job,
            workspace,
            correction,
        };
        let mut attempt = Attempt::new(job.id.clone(), workspace.attempt);
        attempt.artifact_path = Some(workspace.output_path.clone());

        attempt.transition(AttemptStatus::Running)?;
        self.emit(Event::AttemptStarted {
            job_id: job.id.to_string(),
            attempt: attempt.number.get(),
        });
        info!(job_id = %job.id, attempt = attempt.number.get(), "Attempt running");

        if let Err(e) = self.runner.extract(ctx).await {
            warn!(job_id = %job.id, error = %e, "Extraction failed");
            attempt.fail(format!("extraction failed: {}", e))?;
            return Ok(attempt);
        }

        attempt.transition(AttemptStatus::Validating)?;
        let report = match self.validate(ctx).await {
            Ok(report) => report,
            Err(e) => {
                attempt.fail(format!("validator error: {}", e))?;
                return Ok(attempt);
            }
        };
        if report.passed {
            attempt.validation = Some(report);
            attempt.transition(AttemptStatus::Succeeded)?;
            return Ok(attempt);
        }

        debug!(job_id = %job.id, diagnostics = report.diagnostics.len(), "Validation failed");
        attempt.validation = Some(report.clone());
        if !attempt.can_repair() {
            attempt.fail(OrchestratorError::ValidationFailure(report.summary()).to_string())?;
            return Ok(attempt);
        }

        attempt.transition(AttemptStatus::Repairing)?;
        self.emit(Event::RepairStarted {
            job_id: job.id.to_string(),
            attempt: attempt.number.get(),
        });
        info!(job_id = %job.id, attempt = attempt.number.get(), "Repairing artifact");

        if let Err(e) = self.runner.repair(ctx, &report).await {
            attempt.fail(format!("repair failed: {}", e))?;
            return Ok(attempt);
        }

        attempt.transition(AttemptStatus::Validating)?;
        match self.validate(ctx).await {
            Ok(report) if report.passed => {
                attempt.validation = Some(report);
                attempt.transition(AttemptStatus::Succeeded)?;
            }
            Ok(report) => {
                let reason = OrchestratorError::ValidationFailure(format!(
                    "still invalid after repair: {}",
                    report.summary()
                ));
                attempt.validation = Some(report);
                attempt.fail(reason.to_string())?;
            }
            Err(e) => attempt.fail(format!("validator error: {}", e))?,
        }
        Ok(attempt)
    }

    /// A missing artifact is a failed validation, not a validator error.
    async fn validate(&self, ctx: WorkerContext<'_>) -> Result<ValidationReport> {
        let request = ctx.validation_request();
        if !tokio::fs::try_exists(&request.output_path).await.unwrap_or(false) {
            return Ok(ValidationReport::fail(vec![format!(
                "artifact not found: {}",
                request.output_path.display()
            )]));
        }
        self.validator.validate(ctx, &request).await
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}

/// Command lines for the command-backed collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommands {
    pub extract: Vec<String>,
    /// Falls back to `extract` with `ISOBATCH_REPAIR=1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<Vec<String>>,
    pub validate: Vec<String>,
}

/// Runs the configured extraction command inside the sandbox.
pub struct CommandRunner {
    sandbox: Arc<dyn Sandbox>,
    extract: Vec<String>,
    repair: Option<Vec<String>>,
}

impl CommandRunner {
    pub fn new(sandbox: Arc<dyn Sandbox>, commands: &WorkerCommands) -> Result<Self> {
        if commands.extract.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "no extract command configured".into(),
            ));
        }
        Ok(Self {
            sandbox,
            extract: commands.extract.clone(),
            repair: commands.repair.clone().filter(|argv| !argv.is_empty()),
        })
    }

    async fn run(&self, ctx: WorkerContext<'_>, command: SandboxCommand) -> Result<()> {
        let output = self.sandbox.run(&ctx.worker_policy(), &command).await?;
        if output.success() {
            Ok(())
        } else {
            Err(OrchestratorError::Runner(single_line(&format!(
                "{} exited with {}: {}",
                command.program,
                output.status,
                output.tail(5)
            ))))
        }
    }

    fn command(argv: &[String], ctx: WorkerContext<'_>) -> Result<SandboxCommand> {
        let mut command = SandboxCommand::from_argv(argv)
            .ok_or_else(|| OrchestratorError::InvalidConfig("empty worker command".into()))?;
        command.env = ctx.env();
        Ok(command)
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn extract(&self, ctx: WorkerContext<'_>) -> Result<()> {
        self.run(ctx, Self::command(&self.extract, ctx)?).await
    }

    async fn repair(&self, ctx: WorkerContext<'_>, report: &ValidationReport) -> Result<()> {
        let argv = self.repair.as_ref().unwrap_or(&self.extract);
        let command = Self::command(argv, ctx)?
            .env("ISOBATCH_REPAIR", "1")
            .env("ISOBATCH_DIAGNOSTICS", report.diagnostics.join("\n"));
        self.run(ctx, command).await
    }
}

/// Runs the configured validator command inside a read-only sandbox.
/// Exit status 0 means pass.
pub struct CommandValidator {
    sandbox: Arc<dyn Sandbox>,
    argv: Vec<String>,
}

impl CommandValidator {
    pub fn new(sandbox: Arc<dyn Sandbox>, argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "no validate command configured".into(),
            ));
        }
        Ok(Self { sandbox, argv })
    }

    pub fn build_command(&self, request: &ValidationRequest) -> Result<SandboxCommand> {
        let mut command = SandboxCommand::from_argv(&self.argv)
            .ok_or_else(|| OrchestratorError::InvalidConfig("empty validate command".into()))?
            .arg("--json-path")
            .arg(request.output_path.display().to_string());
        if let Some(valid) = request.expected_valid {
            command = command.arg("--expect-valid").arg(valid.to_string());
        }
        if let Some(count) = request.expected_count {
            command = command.arg("--expect-count").arg(count.to_string());
        }
        if request.strict_rounding {
            command = command.arg("--strict-rounding");
        }
        Ok(command)
    }
}

/// Lines the validator marks as failures; everything else is noise.
fn parse_diagnostics(stdout: &str, stderr: &str) -> Vec<String> {
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .filter_map(|line| {
            line.strip_prefix("[FAIL]")
                .or_else(|| line.strip_prefix("- "))
                .map(|rest| rest.trim().to_string())
        })
        .filter(|line| !line.is_empty())
        .collect()
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(
        &self,
        ctx: WorkerContext<'_>,
        request: &ValidationRequest,
    ) -> Result<ValidationReport> {
        let command = self.build_command(request)?;
        let output = self.sandbox.run(&ctx.validator_policy(), &command).await?;

        if output.success() {
            return Ok(ValidationReport::pass());
        }
        let mut diagnostics = parse_diagnostics(&output.stdout, &output.stderr);
        if diagnostics.is_empty() {
            diagnostics.push(single_line(&format!(
                "validator exited with {}: {}",
                output.status,
                output.tail(3)
            )));
        }
        Ok(ValidationReport::fail(diagnostics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isobatch_core::{AttemptNumber, ExpectedResult, JobId};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use vcs::Workspace;

    /// Writes `contents[i]` on the i-th call (extract is call 0).
    struct ScriptedRunner {
        contents: Vec<Option<&'static str>>,
        calls: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(contents: Vec<Option<&'static str>>) -> Self {
            Self {
                contents,
                calls: AtomicUsize::new(0),
            }
        }

        async fn write(&self, ctx: WorkerContext<'_>) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.contents.get(call).copied().flatten() {
                Some(text) => {
                    tokio::fs::write(&ctx.workspace.output_path, text).await?;
                    Ok(())
                }
                None => Err(OrchestratorError::Runner("boom".into())),
            }
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn extract(&self, ctx: WorkerContext<'_>) -> Result<()> {
            self.write(ctx).await
        }

        async fn repair(&self, ctx: WorkerContext<'_>, _report: &ValidationReport) -> Result<()> {
            self.write(ctx).await
        }
    }

    struct ContentValidator;

    #[async_trait]
    impl Validator for ContentValidator {
        async fn validate(
            &self,
            _ctx: WorkerContext<'_>,
            request: &ValidationRequest,
        ) -> Result<ValidationReport> {
            let text = tokio::fs::read_to_string(&request.output_path).await?;
            if text == "valid" {
                Ok(ValidationReport::pass())
            } else {
                Ok(ValidationReport::fail(vec![format!("bad content: {}", text)]))
            }
        }
    }

    fn workspace(temp: &TempDir) -> JobWorkspace {
        let root = temp.path().join("wt");
        let output_dir = root.join("tmp/p1");
        std::fs::create_dir_all(&output_dir).unwrap();
        JobWorkspace {
            job_id: JobId::slugify("p1"),
            attempt: AttemptNumber::First,
            workspace: Workspace::new("p1-a1-t", root.clone(), "isobatch-worker/p1-a1-t"),
            source_dir: root.join("papers/p1"),
            output_path: output_dir.join("p1.json"),
            read_write: vec![output_dir.clone()],
            output_dir,
            read_only: Vec::new(),
        }
    }

    fn worker(contents: Vec<Option<&'static str>>) -> (WorkerUnit, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new(contents));
        let unit = WorkerUnit::new(runner.clone(), Arc::new(ContentValidator));
        (unit, runner)
    }

    fn job() -> Job {
        Job::new(JobId::slugify("p1"), "papers/p1")
    }

    #[tokio::test]
    async fn test_valid_first_pass() {
        let temp = TempDir::new().unwrap();
        let (unit, runner) = worker(vec![Some("valid")]);

        let attempt = unit.execute(&job(), &workspace(&temp), None).await.unwrap();

        assert!(attempt.succeeded());
        assert_eq!(attempt.repairs(), 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_repair_recovers() {
        let temp = TempDir::new().unwrap();
        let (unit, runner) = worker(vec![Some("invalid"), Some("valid")]);

        let attempt = unit.execute(&job(), &workspace(&temp), None).await.unwrap();

        assert!(attempt.succeeded());
        assert_eq!(attempt.repairs(), 1);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repair_never_loops() {
        let temp = TempDir::new().unwrap();
        let (unit, runner) = worker(vec![Some("invalid"), Some("still bad"), Some("valid")]);

        let attempt = unit.execute(&job(), &workspace(&temp), None).await.unwrap();

        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.repairs(), 1);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        let reason = attempt.failure_reason.unwrap();
        assert!(reason.contains("still invalid after repair"), "{}", reason);
    }

    #[tokio::test]
    async fn test_extract_error_skips_repair() {
        let temp = TempDir::new().unwrap();
        let (unit, runner) = worker(vec![None, Some("valid")]);

        let attempt = unit.execute(&job(), &workspace(&temp), None).await.unwrap();

        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.repairs(), 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(attempt.failure_reason.unwrap().starts_with("extraction failed"));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_repairable() {
        struct SilentThenWrite(AtomicUsize);

        #[async_trait]
        impl JobRunner for SilentThenWrite {
            async fn extract(&self, _ctx: WorkerContext<'_>) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            async fn repair(&self, ctx: WorkerContext<'_>, report: &ValidationReport) -> Result<()> {
                assert!(report.diagnostics[0].starts_with("artifact not found"));
                tokio::fs::write(&ctx.workspace.output_path, "valid").await?;
                Ok(())
            }
        }

        let temp = TempDir::new().unwrap();
        let unit = WorkerUnit::new(
            Arc::new(SilentThenWrite(AtomicUsize::new(0))),
            Arc::new(ContentValidator),
        );

        let attempt = unit.execute(&job(), &workspace(&temp), None).await.unwrap();
        assert!(attempt.succeeded());
        assert_eq!(attempt.repairs(), 1);
    }

    #[test]
    fn test_correction_render() {
        let mut attempt = Attempt::new(JobId::slugify("p1"), AttemptNumber::First);
        attempt.transition(AttemptStatus::Running).unwrap();
        attempt.transition(AttemptStatus::Validating).unwrap();
        attempt.validation = Some(ValidationReport::fail(vec!["count 3 != 4".into()]));
        attempt.fail("Validation failed: count 3 != 4").unwrap();

        let correction = Correction::from_attempt(&attempt);
        assert_eq!(
            correction.render(),
            "Validation failed: count 3 != 4; count 3 != 4"
        );
    }

    #[test]
    fn test_validator_command_flags() {
        struct NoSandbox;

        #[async_trait]
        impl Sandbox for NoSandbox {
            fn name(&self) -> &'static str {
                "none"
            }
            async fn is_available(&self) -> bool {
                false
            }
            async fn launch(
                &self,
                _policy: &SandboxPolicy,
                _command: &SandboxCommand,
            ) -> sandbox::Result<sandbox::ProcessHandle> {
                Err(sandbox::SandboxError::Unavailable("test".into()))
            }
        }

        let validator = CommandValidator::new(
            Arc::new(NoSandbox),
            vec!["python3".into(), "tools/validate.py".into()],
        )
        .unwrap();
        let expected = ExpectedResult {
            expected_valid: Some(true),
            expected_count: Some(7),
            strict_rounding: true,
        };
        let request = ValidationRequest::new(PathBuf::from("/wt/tmp/p1/p1.json"), &expected);

        let command = validator.build_command(&request).unwrap();
        assert_eq!(command.program, "python3");
        assert_eq!(
            command.args,
            vec![
                "tools/validate.py",
                "--json-path",
                "/wt/tmp/p1/p1.json",
                "--expect-valid",
                "true",
                "--expect-count",
                "7",
                "--strict-rounding",
            ]
        );
        assert!(CommandValidator::new(Arc::new(NoSandbox), vec![]).is_err());
    }

    #[test]
    fn test_parse_diagnostics() {
        let stdout = "checking...\n[FAIL] fc_value missing\n  - count mismatch\nok\n";
        let stderr = "[FAIL]\n";
        assert_eq!(
            parse_diagnostics(stdout, stderr),
            vec!["fc_value missing", "count mismatch"]
        );
    }

    #[test]
    fn test_policies() {
        let temp = TempDir::new().unwrap();
        let ws = workspace(&temp);
        let job = job();
        let ctx = WorkerContext {
            job: &job,
            workspace: &ws,
            correction: None,
        };

        let worker = ctx.worker_policy();
        assert!(worker.allows_write(&ws.output_path));

        let validator = ctx.validator_policy();
        assert!(validator.read_write.is_empty());
        assert!(validator.read_only.contains(&ws.output_dir));
    }
}
