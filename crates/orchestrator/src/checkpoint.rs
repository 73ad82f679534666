//! Batched commit and publish of the output directory.

use events::{Event, EventBus};
use isobatch_core::{CheckpointState, JobOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use vcs::{RepoLock, VersionControl};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::output::write_atomic;

/// Durable JSON file holding the [`CheckpointState`].
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means a fresh counter.
    pub async fn load(&self) -> Result<CheckpointState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointState::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, state: &CheckpointState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.path, json.as_bytes()).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub commit_every: u32,
    pub publish_every: u32,
    /// Repository-relative directory that commits may include.
    pub output_dir: PathBuf,
    pub remote: String,
    pub branch: Option<String>,
    /// `{count}` is replaced with the total number of completed jobs.
    pub message_template: String,
}

impl CheckpointPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            commit_every: config.commit_every,
            publish_every: config.publish_every,
            output_dir: config.output_rel(),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            message_template: config.commit_message.clone(),
        }
    }

    fn message(&self, count: u64) -> String {
        self.message_template.replace("{count}", &count.to_string())
    }

    fn outside_output<'a>(&self, paths: &'a [String]) -> Vec<&'a String> {
        paths
            .iter()
            .filter(|p| !Path::new(p.as_str()).starts_with(&self.output_dir))
            .collect()
    }
}

/// What a completion triggered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointAction {
    /// New revision when a commit was made.
    pub committed: Option<String>,
    pub published: bool,
}

/// Counts terminal outcomes and commits/publishes at the thresholds.
///
/// Driven from the scheduler's control loop, so one completion is fully
/// accounted for (and persisted) before the next is seen.
pub struct CheckpointPublisher {
    vcs: Arc<dyn VersionControl>,
    store: CheckpointStore,
    state: CheckpointState,
    policy: CheckpointPolicy,
    lock: RepoLock,
    event_bus: Option<EventBus>,
}

impl CheckpointPublisher {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        store: CheckpointStore,
        state: CheckpointState,
        policy: CheckpointPolicy,
        lock: RepoLock,
    ) -> Self {
        Self {
            vcs,
            store,
            state,
            policy,
            lock,
            event_bus: None,
        }
    }

    /// Resume from the persisted counter.
    pub async fn open(
        vcs: Arc<dyn VersionControl>,
        store: CheckpointStore,
        policy: CheckpointPolicy,
        lock: RepoLock,
    ) -> Result<Self> {
        let state = store.load().await?;
        debug!(
            since_commit = state.completed_since_commit,
            since_publish = state.completed_since_publish,
            "Checkpoint state loaded"
        );
        Ok(Self::new(vcs, store, state, policy, lock))
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub async fn on_job_completed(&mut self, outcome: &JobOutcome) -> Result<CheckpointAction> {
        self.state.record_completion();
        self.store.save(&self.state).await?;
        debug!(
            job_id = %outcome.job_id,
            since_commit = self.state.completed_since_commit,
            "Completion counted"
        );

        let mut action = CheckpointAction::default();

        if self.state.commit_due(self.policy.commit_every) {
            let revision = self.commit().await?;
            self.state.reset_commit(revision.clone());
            self.store.save(&self.state).await?;
            action.committed = revision;
        }

        if self.state.publish_due(self.policy.publish_every) {
            let pushed = self.publish().await?;
            self.state.reset_publish(pushed);
            self.store.save(&self.state).await?;
            action.published = pushed;
        }

        Ok(action)
    }

    /// Commit the output directory. Refuses, leaving the index untouched,
    /// when anything outside it is already staged.
    async fn commit(&self) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;

        let staged = self.vcs.staged_files().await?;
        self.check_staged(&staged)?;

        self.vcs.stage(&self.policy.output_dir).await?;
        let staged = self.vcs.staged_files().await?;
        self.check_staged(&staged)?;

        if staged.is_empty() {
            info!("Checkpoint reached with no output changes; nothing to commit");
            return Ok(None);
        }

        let message = self.policy.message(self.state.total_completed);
        let revision = self.vcs.commit(&message).await?;
        info!(revision = %revision, files = staged.len(), "Checkpoint committed");
        self.emit(Event::CheckpointCommitted {
            revision: revision.clone(),
            completed: self.state.total_completed,
        });
        Ok(Some(revision))
    }

    fn check_staged(&self, staged: &[String]) -> Result<()> {
        let outside = self.policy.outside_output(staged);
        if outside.is_empty() {
            return Ok(());
        }
        let paths: Vec<String> = outside.into_iter().cloned().collect();
        error!(paths = ?paths, "Refusing checkpoint commit");
        Err(OrchestratorError::CommitPolicyViolation { paths })
    }

    /// Push when commits are waiting; a no-op otherwise.
    async fn publish(&self) -> Result<bool> {
        if self.state.unpublished_commits == 0 {
            info!("Publish threshold reached with no new commits; nothing to push");
            return Ok(false);
        }

        let _guard = self.lock.lock().await;
        let branch = match &self.policy.branch {
            Some(branch) => branch.clone(),
            None => self.vcs.current_branch().await?.ok_or_else(|| {
                OrchestratorError::Publish("repository is on a detached HEAD".into())
            })?,
        };
        if !self.vcs.has_remote(&self.policy.remote).await? {
            return Err(OrchestratorError::Publish(format!(
                "remote {} is not configured",
                self.policy.remote
            )));
        }

        self.vcs
            .push(&self.policy.remote, &branch)
            .await
            .map_err(|e| OrchestratorError::Publish(e.to_string()))?;
        info!(remote = %self.policy.remote, branch = %branch, "Checkpoint published");
        self.emit(Event::CheckpointPublished {
            remote: self.policy.remote.clone(),
            branch,
        });
        Ok(true)
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use isobatch_core::{FailureRecord, JobId};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;
    use vcs::{VcsError, Workspace};

    /// In-memory repository: `dirty` paths become staged on `stage`.
    #[derive(Default)]
    struct MockVcs {
        dirty: Mutex<Vec<String>>,
        staged: Mutex<Vec<String>>,
        commits: Mutex<Vec<String>>,
        pushes: Mutex<Vec<(String, String)>>,
        remote: bool,
        detached: bool,
    }

    impl MockVcs {
        fn with_remote() -> Self {
            Self {
                remote: true,
                ..Default::default()
            }
        }

        fn touch(&self, path: &str) {
            self.dirty.lock().unwrap().push(path.to_string());
        }

        fn stage_now(&self, path: &str) {
            self.staged.lock().unwrap().push(path.to_string());
        }
    }

    #[async_trait]
    impl VersionControl for MockVcs {
        fn name(&self) -> &'static str {
            "mock"
        }
        fn repo_path(&self) -> &Path {
            Path::new("/repo")
        }
        async fn is_available(&self) -> bool {
            true
        }
        async fn is_initialized(&self) -> vcs::Result<bool> {
            Ok(true)
        }
        async fn create_workspace(&self, _: &Path, _: &str, _: &str) -> vcs::Result<Workspace> {
            Err(VcsError::CommandFailed("unsupported".into()))
        }
        async fn cleanup_workspace(&self, _: &Workspace) -> vcs::Result<()> {
            Ok(())
        }
        async fn list_workspaces(&self) -> vcs::Result<Vec<Workspace>> {
            Ok(Vec::new())
        }
        async fn staged_files(&self) -> vcs::Result<Vec<String>> {
            Ok(self.staged.lock().unwrap().clone())
        }
        async fn stage(&self, pathspec: &Path) -> vcs::Result<()> {
            let mut dirty = self.dirty.lock().unwrap();
            let mut staged = self.staged.lock().unwrap();
            dirty.retain(|p| {
                if Path::new(p).starts_with(pathspec) {
                    staged.push(p.clone());
                    false
                } else {
                    true
                }
            });
            Ok(())
        }
        async fn commit(&self, message: &str) -> vcs::Result<String> {
            self.staged.lock().unwrap().clear();
            let mut commits = self.commits.lock().unwrap();
            commits.push(message.to_string());
            Ok(format!("rev{}", commits.len()))
        }
        async fn current_branch(&self) -> vcs::Result<Option<String>> {
            Ok((!self.detached).then(|| "main".to_string()))
        }
        async fn has_remote(&self, _: &str) -> vcs::Result<bool> {
            Ok(self.remote)
        }
        async fn push(&self, remote: &str, branch: &str) -> vcs::Result<()> {
            self.pushes
                .lock()
                .unwrap()
                .push((remote.to_string(), branch.to_string()));
            Ok(())
        }
    }

    fn policy(commit_every: u32, publish_every: u32) -> CheckpointPolicy {
        let config = OrchestratorConfig::default().with_thresholds(commit_every, publish_every);
        CheckpointPolicy::from_config(&config)
    }

    fn publisher(
        vcs: Arc<MockVcs>,
        temp: &TempDir,
        commit_every: u32,
        publish_every: u32,
    ) -> CheckpointPublisher {
        CheckpointPublisher::new(
            vcs,
            CheckpointStore::new(temp.path().join("checkpoint.json")),
            CheckpointState::default(),
            policy(commit_every, publish_every),
            Arc::new(AsyncMutex::new(())),
        )
    }

    fn outcome(i: usize, success: bool) -> JobOutcome {
        let id = JobId::slugify(&format!("p{}", i));
        if success {
            let mut attempt = isobatch_core::Attempt::new(id, isobatch_core::AttemptNumber::First);
            attempt.status = isobatch_core::AttemptStatus::Succeeded;
            JobOutcome::succeeded(&attempt, 0, PathBuf::from(format!("output/p{}.json", i)))
        } else {
            let record = FailureRecord::new(id, 2, "invalid", None, PathBuf::from("output/x.json"));
            JobOutcome::failed(record, 2)
        }
    }

    #[tokio::test]
    async fn test_exact_commit_and_publish_counts() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::with_remote());
        let mut publisher = publisher(vcs.clone(), &temp, 10, 20);

        let mut commits_seen = Vec::new();
        for i in 1..=20 {
            vcs.touch(&format!("output/p{}.json", i));
            let action = publisher.on_job_completed(&outcome(i, i % 4 != 0)).await.unwrap();
            if action.committed.is_some() {
                commits_seen.push(i);
            }
            if i < 20 {
                assert!(!action.published, "published early at {}", i);
            } else {
                assert!(action.published);
            }
        }

        assert_eq!(commits_seen, vec![10, 20]);
        assert_eq!(
            vcs.commits.lock().unwrap().clone(),
            vec!["isobatch: processed 10 jobs", "isobatch: processed 20 jobs"]
        );
        assert_eq!(
            vcs.pushes.lock().unwrap().clone(),
            vec![("origin".to_string(), "main".to_string())]
        );
        let state = publisher.state();
        assert_eq!(state.completed_since_commit, 0);
        assert_eq!(state.completed_since_publish, 0);
        assert_eq!(state.unpublished_commits, 0);
        assert_eq!(state.total_completed, 20);
    }

    #[tokio::test]
    async fn test_commit_refused_for_foreign_staged_paths() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::with_remote());
        vcs.stage_now("src/lib.rs");
        vcs.touch("output/p1.json");
        let mut publisher = publisher(vcs.clone(), &temp, 1, 2);

        let err = publisher.on_job_completed(&outcome(1, true)).await.unwrap_err();

        match err {
            OrchestratorError::CommitPolicyViolation { paths } => {
                assert_eq!(paths, vec!["src/lib.rs"])
            }
            other => panic!("unexpected error: {}", other),
        }
        // Nothing was staged or committed on our behalf.
        assert_eq!(vcs.staged.lock().unwrap().clone(), vec!["src/lib.rs"]);
        assert_eq!(vcs.dirty.lock().unwrap().clone(), vec!["output/p1.json"]);
        assert!(vcs.commits.lock().unwrap().is_empty());
        assert_eq!(publisher.state().completed_since_commit, 1);
    }

    #[tokio::test]
    async fn test_nothing_changed_is_noop() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::with_remote());
        let mut publisher = publisher(vcs.clone(), &temp, 1, 2);

        let first = publisher.on_job_completed(&outcome(1, false)).await.unwrap();
        let second = publisher.on_job_completed(&outcome(2, false)).await.unwrap();

        assert_eq!(first, CheckpointAction::default());
        assert_eq!(second, CheckpointAction::default());
        assert!(vcs.commits.lock().unwrap().is_empty());
        assert!(vcs.pushes.lock().unwrap().is_empty());
        assert_eq!(publisher.state().completed_since_publish, 0);
    }

    #[tokio::test]
    async fn test_publish_fails_loudly_without_remote() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::default());
        let mut publisher = publisher(vcs.clone(), &temp, 1, 1);
        vcs.touch("output/p1.json");

        let err = publisher.on_job_completed(&outcome(1, true)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Publish(_)));
        assert_eq!(vcs.commits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_state_persists_across_publishers() {
        let temp = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::with_remote());
        let store = CheckpointStore::new(temp.path().join("state/checkpoint.json"));
        let lock: RepoLock = Arc::new(AsyncMutex::new(()));

        let mut first =
            CheckpointPublisher::open(vcs.clone(), store.clone(), policy(10, 20), lock.clone())
                .await
                .unwrap();
        for i in 1..=6 {
            first.on_job_completed(&outcome(i, true)).await.unwrap();
        }
        drop(first);

        let mut second = CheckpointPublisher::open(vcs.clone(), store, policy(10, 20), lock)
            .await
            .unwrap();
        assert_eq!(second.state().completed_since_commit, 6);
        for i in 7..=10 {
            vcs.touch(&format!("output/p{}.json", i));
            second.on_job_completed(&outcome(i, true)).await.unwrap();
        }
        assert_eq!(vcs.commits.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_outside_output() {
        let policy = policy(10, 20);
        let staged = vec![
            "output/p1.json".to_string(),
            "output/failures.json".to_string(),
            "outputs/evil.json".to_string(),
            "README.md".to_string(),
        ];
        let outside = policy.outside_output(&staged);
        assert_eq!(outside, vec!["outputs/evil.json", "README.md"]);
    }

    #[test]
    fn test_dot_prefixed_output_dir_accepts_output_paths() {
        let config = OrchestratorConfig::default().with_output_dir("./output");
        let policy = CheckpointPolicy::from_config(&config);
        assert_eq!(policy.output_dir, PathBuf::from("output"));

        let staged = vec!["output/p1.json".to_string(), "README.md".to_string()];
        assert_eq!(policy.outside_output(&staged), vec!["README.md"]);
    }

    #[test]
    fn test_message_template() {
        let policy = policy(10, 20);
        assert_eq!(policy.message(30), "isobatch: processed 30 jobs");
    }
}
