mod config;
mod progress;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use events::EventBus;
use orchestrator::{
    CheckpointStore, CommandRunner, CommandValidator, JobSource, Orchestrator, OutputStore,
    RunExit, RunReport,
};
use sandbox::{BubblewrapSandbox, Sandbox};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vcs::{GitVcs, VersionControl, WorkspaceAllocator};

use crate::config::{IsobatchConfig, CONFIG_FILE, STATE_DIR};
use crate::progress::RunProgress;

#[derive(Parser)]
#[command(name = "isobatch")]
#[command(about = "Run extraction jobs in sandboxed git worktrees with validation and checkpoints", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository to operate on (defaults to the one containing the cwd)
    #[arg(short = 'C', long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .isobatch/config.toml
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Process every job
    Run(RunArgs),
    /// Show checkpoint counters and the failure log
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove worker worktrees left behind by interrupted runs
    Clean,
}

#[derive(Args)]
struct RunArgs {
    /// Job directory or manifest (overrides [jobs].source)
    #[arg(long)]
    jobs: Option<PathBuf>,

    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    #[arg(long)]
    commit_every: Option<u32>,

    #[arg(long)]
    publish_every: Option<u32>,

    #[arg(long)]
    max_attempts: Option<u8>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    remote: Option<String>,

    #[arg(long)]
    branch: Option<String>,

    /// Let workers reach the network
    #[arg(long)]
    share_network: bool,

    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let repo = find_repo(cli.repo.as_deref()).await?;
    match cli.command {
        Commands::Init { force } => init_project(&repo, force).await.map(|_| ExitCode::SUCCESS),
        Commands::Run(args) => run(&repo, args).await,
        Commands::Status { json } => status(&repo, json).await.map(|_| ExitCode::SUCCESS),
        Commands::Clean => clean(&repo).await.map(|_| ExitCode::SUCCESS),
    }
}

/// The enclosing git repository, or the directory itself so that `run`
/// can report the missing repository as a precondition failure.
async fn find_repo(explicit: Option<&Path>) -> Result<PathBuf> {
    let start = match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()?,
    };
    match GitVcs::discover(&start).await {
        Ok(vcs) => Ok(vcs.repo_path().to_path_buf()),
        Err(e) => {
            tracing::debug!(error = %e, "No enclosing repository");
            Ok(start)
        }
    }
}

async fn init_project(repo: &Path, force: bool) -> Result<()> {
    let config_path = IsobatchConfig::path(repo);
    if config_path.exists() && !force {
        println!("Already initialized: {}", config_path.display());
        return Ok(());
    }

    let state_dir = repo.join(STATE_DIR);
    tokio::fs::create_dir_all(&state_dir).await?;
    tokio::fs::write(&config_path, IsobatchConfig::default().to_toml()?)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    tokio::fs::write(
        state_dir.join(".gitignore"),
        "worktrees/\nquarantine/\ncheckpoint.json\n",
    )
    .await?;

    println!();
    println!("Initialized isobatch in {}", repo.display());
    println!();
    println!("Created:");
    println!("  {}/", STATE_DIR);
    println!("  ├── {}", CONFIG_FILE);
    println!("  └── .gitignore");
    println!();
    println!("Next steps:");
    println!("  1. Point [jobs].source at your job directory or manifest");
    println!("  2. Set [commands].extract and [commands].validate");
    println!("  3. Run 'isobatch run'");

    Ok(())
}

async fn run(repo: &Path, args: RunArgs) -> Result<ExitCode> {
    match prepare_and_run(repo, args).await {
        Ok(report) => {
            print_report(&report);
            Ok(exit_code(report.exit()))
        }
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            Ok(exit_code(RunExit::Precondition))
        }
    }
}

async fn prepare_and_run(repo: &Path, args: RunArgs) -> Result<RunReport> {
    let mut config = IsobatchConfig::load(repo).await?;
    apply_overrides(&mut config, &args);

    let vcs: Arc<dyn VersionControl> = Arc::new(GitVcs::new(repo.to_path_buf()));
    let mut bwrap = match &config.sandbox.bwrap {
        Some(binary) => BubblewrapSandbox::with_binary(binary.clone()),
        None => BubblewrapSandbox::new(),
    };
    bwrap = bwrap
        .with_network(config.sandbox.share_network)
        .protect(repo.to_path_buf());
    if let Some(paths) = &config.sandbox.system_paths {
        bwrap = bwrap.with_system_paths(paths.clone());
    }
    let sandbox: Arc<dyn Sandbox> = Arc::new(bwrap);

    let runner = Arc::new(CommandRunner::new(Arc::clone(&sandbox), &config.commands)?);
    let validator = Arc::new(CommandValidator::new(
        Arc::clone(&sandbox),
        config.commands.validate.clone(),
    )?);

    let source = JobSource::detect(repo.join(&config.jobs.source));
    let jobs = source
        .load(repo)
        .await
        .with_context(|| format!("Failed to load jobs from {}", config.jobs.source.display()))?;

    let bus = EventBus::new();
    let progress = (!args.no_progress && console::Term::stderr().is_term())
        .then(|| RunProgress::attach(&bus, jobs.len()));

    let orchestrator = Orchestrator::new(config.orchestrator, vcs, sandbox, runner, validator)
        .with_event_bus(bus);
    match orchestrator.start_run(jobs).await {
        Ok(report) => {
            if let Some(progress) = progress {
                progress.finish().await;
            }
            Ok(report)
        }
        Err(e) => {
            if let Some(progress) = progress {
                progress.abort();
            }
            Err(e.into())
        }
    }
}

fn apply_overrides(config: &mut IsobatchConfig, args: &RunArgs) {
    let orch = &mut config.orchestrator;
    if let Some(jobs) = &args.jobs {
        config.jobs.source = jobs.clone();
    }
    if let Some(cap) = args.concurrency {
        orch.concurrency = cap;
    }
    if let Some(n) = args.commit_every {
        orch.commit_every = n;
    }
    if let Some(n) = args.publish_every {
        orch.publish_every = n;
    }
    if let Some(n) = args.max_attempts {
        orch.max_attempts = n;
    }
    if let Some(dir) = &args.output_dir {
        orch.output_dir = dir.clone();
    }
    if let Some(remote) = &args.remote {
        orch.remote = remote.clone();
    }
    if let Some(branch) = &args.branch {
        orch.branch = Some(branch.clone());
    }
    if args.share_network {
        config.sandbox.share_network = true;
    }
}

fn exit_code(exit: RunExit) -> ExitCode {
    ExitCode::from(exit.code() as u8)
}

fn print_report(report: &RunReport) {
    println!();
    println!("Run {}", report.run_token);
    println!("════════════════════════════════════════");
    for outcome in &report.outcomes {
        let status = if outcome.is_success() {
            "succeeded".green()
        } else {
            "failed".red()
        };
        let detail = outcome.reason.as_deref().unwrap_or("");
        println!(
            "  {:<10} {:<32} attempts={} repairs={} {}",
            status, outcome.job_id, outcome.attempts, outcome.repairs, detail
        );
    }
    println!();
    println!(
        "  {} succeeded, {} failed",
        report.succeeded().to_string().green(),
        report.failed().to_string().red()
    );
    for error in &report.checkpoint_errors {
        println!("  {} {}", "checkpoint:".yellow(), error);
    }
    println!();
}

async fn status(repo: &Path, json: bool) -> Result<()> {
    let config = IsobatchConfig::load(repo).await?;
    let orch = &config.orchestrator;

    let checkpoint = CheckpointStore::new(orch.checkpoint_path()).load().await?;
    let failures = OutputStore::from_config(orch)
        .load_failures()
        .await?;

    if json {
        let value = serde_json::json!({
            "repo": repo,
            "checkpoint": checkpoint,
            "failures": failures,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let bwrap = which::which("bwrap").ok();
    println!();
    println!("Repository: {}", repo.display());
    println!(
        "Sandbox:    {}",
        match &bwrap {
            Some(path) => path.display().to_string().green(),
            None => "bwrap not found".red(),
        }
    );
    println!();
    println!("Checkpoint:");
    println!("  completed total:        {}", checkpoint.total_completed);
    println!(
        "  since last commit:      {} / {}",
        checkpoint.completed_since_commit, orch.commit_every
    );
    println!(
        "  since last publish:     {} / {}",
        checkpoint.completed_since_publish, orch.publish_every
    );
    println!("  unpublished commits:    {}", checkpoint.unpublished_commits);
    if let Some(rev) = &checkpoint.last_commit {
        println!("  last commit:            {}", rev);
    }
    println!();

    if failures.is_empty() {
        println!("No recorded failures.");
    } else {
        println!("Failures ({}):", failures.len());
        for record in failures.values() {
            println!(
                "  {} {} (attempts={}) {}",
                "✗".red(),
                record.job_id,
                record.attempts,
                record.reason
            );
        }
    }
    println!();

    Ok(())
}

async fn clean(repo: &Path) -> Result<()> {
    let config = IsobatchConfig::load(repo).await?;
    let vcs = GitVcs::discover(repo)
        .await
        .context("isobatch clean must run inside a git repository")?;
    let allocator = WorkspaceAllocator::new(
        Arc::new(vcs),
        config.orchestrator.workspace_config("clean"),
    );

    let removed = allocator.reclaim_stale().await?;
    if removed.is_empty() {
        println!("No stale workspaces.");
    } else {
        for workspace in &removed {
            println!("  removed {} ({})", workspace.key, workspace.path.display());
        }
        println!("Removed {} stale workspace(s).", removed.len());
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "isobatch=info,orchestrator=info,vcs=info,sandbox=info".into()
            }),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["isobatch", "run"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config = IsobatchConfig::default();
        apply_overrides(
            &mut config,
            &args(&[
                "--jobs",
                "papers.json",
                "-j",
                "5",
                "--commit-every",
                "4",
                "--publish-every",
                "8",
                "--branch",
                "batch",
            ]),
        );

        assert_eq!(config.jobs.source, PathBuf::from("papers.json"));
        assert_eq!(config.orchestrator.concurrency, 5);
        assert_eq!(config.orchestrator.commit_every, 4);
        assert_eq!(config.orchestrator.publish_every, 8);
        assert_eq!(config.orchestrator.branch.as_deref(), Some("batch"));
        assert_eq!(config.orchestrator.remote, "origin");
    }

    #[test]
    fn test_no_flags_keep_file_values() {
        let mut config = IsobatchConfig::default();
        config.orchestrator.concurrency = 7;
        apply_overrides(&mut config, &args(&[]));

        assert_eq!(config.orchestrator.concurrency, 7);
        assert!(!config.sandbox.share_network);
    }

    #[test]
    fn test_clean_takes_no_flags() {
        let cli = Cli::parse_from(["isobatch", "-C", "/tmp/repo", "clean"]);
        assert!(matches!(cli.command, Commands::Clean));
        assert_eq!(cli.repo, Some(PathBuf::from("/tmp/repo")));
    }
}
