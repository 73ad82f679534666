pub mod bwrap;
pub mod error;
pub mod policy;
pub mod traits;

pub use bwrap::{BubblewrapSandbox, SYSTEM_RO_PATHS};
pub use error::{Result, SandboxError};
pub use policy::SandboxPolicy;
pub use traits::{ProcessHandle, ProcessOutput, Sandbox, SandboxCommand};
