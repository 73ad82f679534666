pub mod error;
pub mod git;
pub mod paths;
pub mod traits;
pub mod workspace;

pub use error::{Result, VcsError};
pub use git::GitVcs;
pub use traits::{VersionControl, Workspace, WorkspaceStatus};
pub use workspace::{JobWorkspace, RepoLock, WorkspaceAllocator, WorkspaceConfig};
