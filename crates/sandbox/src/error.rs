use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid sandbox path: {0}")]
    InvalidPath(String),

    #[error("Sandboxed process failed: {0}")]
    Process(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
