use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    /// A git invocation exited non-zero; holds its stderr.
    #[error("git failed: {0}")]
    CommandFailed(String),

    #[error("git binary not found: {0}")]
    CommandNotFound(String),

    #[error("Worktree already exists at {0}")]
    WorkspaceAlreadyExists(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not a git repository: {0}")]
    NotInitialized(String),

    #[error("Could not prepare workspace payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VcsError>;
