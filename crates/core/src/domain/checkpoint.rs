use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable counters driving the commit and publish thresholds.
///
/// The value is passed explicitly into the checkpoint publisher and persisted
/// by it after every change, so a run that spans several invocations keeps
/// counting where the previous one stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default)]
    pub completed_since_commit: u32,
    #[serde(default)]
    pub completed_since_publish: u32,
    #[serde(default)]
    pub unpublished_commits: u32,
    #[serde(default)]
    pub total_completed: u64,
    #[serde(default)]
    pub last_commit: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            completed_since_commit: 0,
            completed_since_publish: 0,
            unpublished_commits: 0,
            total_completed: 0,
            last_commit: None,
            updated_at: Utc::now(),
        }
    }
}

impl CheckpointState {
    pub fn record_completion(&mut self) {
        self.completed_since_commit += 1;
        self.completed_since_publish += 1;
        self.total_completed += 1;
        self.touch();
    }

    pub fn commit_due(&self, commit_every: u32) -> bool {
        commit_every > 0 && self.completed_since_commit >= commit_every
    }

    pub fn publish_due(&self, publish_every: u32) -> bool {
        publish_every > 0 && self.completed_since_publish >= publish_every
    }

    /// Reset after the commit threshold fired; `commit` is the new revision
    /// when something was actually committed.
    pub fn reset_commit(&mut self, commit: Option<String>) {
        self.completed_since_commit = 0;
        if let Some(rev) = commit {
            self.last_commit = Some(rev);
            self.unpublished_commits += 1;
        }
        self.touch();
    }

    pub fn reset_publish(&mut self, pushed: bool) {
        self.completed_since_publish = 0;
        if pushed {
            self.unpublished_commits = 0;
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        let mut state = CheckpointState::default();
        for _ in 0..9 {
            state.record_completion();
        }
        assert!(!state.commit_due(10));
        state.record_completion();
        assert!(state.commit_due(10));
        assert!(!state.publish_due(20));
        assert_eq!(state.total_completed, 10);
    }

    #[test]
    fn test_zero_threshold_never_fires() {
        let mut state = CheckpointState::default();
        state.record_completion();
        assert!(!state.commit_due(0));
        assert!(!state.publish_due(0));
    }

    #[test]
    fn test_resets() {
        let mut state = CheckpointState::default();
        state.record_completion();
        state.reset_commit(Some("abc123".to_string()));
        assert_eq!(state.completed_since_commit, 0);
        assert_eq!(state.completed_since_publish, 1);
        assert_eq!(state.unpublished_commits, 1);
        assert_eq!(state.last_commit.as_deref(), Some("abc123"));

        state.reset_commit(None);
        assert_eq!(state.unpublished_commits, 1);

        state.reset_publish(true);
        assert_eq!(state.completed_since_publish, 0);
        assert_eq!(state.unpublished_commits, 0);
    }

    #[test]
    fn test_deserialize_partial_state() {
        let state: CheckpointState =
            serde_json::from_str(r#"{"completed_since_commit":4,"updated_at":"2026-01-01T00:00:00Z"}"#)
                .unwrap();
        assert_eq!(state.completed_since_commit, 4);
        assert_eq!(state.total_completed, 0);
    }
}
