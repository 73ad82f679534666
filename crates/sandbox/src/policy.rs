use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};

/// Filesystem view granted to one sandboxed process.
///
/// Every entry is a host path that is exposed at the same absolute path
/// inside the sandbox. Anything not listed here (apart from the read-only
/// system directories) does not exist for the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub cwd: PathBuf,
    pub read_only: Vec<PathBuf>,
    pub read_write: Vec<PathBuf>,
}

impl SandboxPolicy {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn with_read_only(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.read_only.extend(paths);
        self
    }

    pub fn with_read_write(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.read_write.extend(paths);
        self
    }

    /// Whether `path` falls inside one of the writable entries.
    pub fn allows_write(&self, path: &Path) -> bool {
        self.read_write.iter().any(|root| path.starts_with(root))
    }

    /// All entries must be absolute and exist. The working directory must lie
    /// inside an entry or be a parent of one (bwrap creates the parents).
    pub fn validate(&self) -> Result<()> {
        for path in self.read_only.iter().chain(self.read_write.iter()) {
            if !path.is_absolute() {
                return Err(SandboxError::InvalidPath(format!(
                    "allow-list entry must be absolute: {}",
                    path.display()
                )));
            }
            if !path.exists() {
                return Err(SandboxError::InvalidPath(format!(
                    "allow-list entry does not exist: {}",
                    path.display()
                )));
            }
        }

        let reachable = self
            .read_only
            .iter()
            .chain(self.read_write.iter())
            .any(|root| self.cwd.starts_with(root) || root.starts_with(&self.cwd));
        if !reachable {
            return Err(SandboxError::InvalidPath(format!(
                "working directory {} is outside the allow-list",
                self.cwd.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_accepts_existing_entries() {
        let temp = TempDir::new().unwrap();
        let rw = temp.path().join("out");
        std::fs::create_dir_all(&rw).unwrap();

        let policy = SandboxPolicy::new(rw.clone())
            .with_read_only(vec![temp.path().to_path_buf()])
            .with_read_write(vec![rw.clone()]);

        assert!(policy.validate().is_ok());
        assert!(policy.allows_write(&rw.join("p1.json")));
        assert!(!policy.allows_write(&temp.path().join("other.json")));
    }

    #[test]
    fn test_validate_rejects_missing_and_relative_entries() {
        let temp = TempDir::new().unwrap();

        let missing = SandboxPolicy::new(temp.path())
            .with_read_write(vec![temp.path().join("missing")]);
        assert!(matches!(missing.validate(), Err(SandboxError::InvalidPath(_))));

        let relative = SandboxPolicy::new(temp.path()).with_read_only(vec![PathBuf::from("rel")]);
        assert!(matches!(relative.validate(), Err(SandboxError::InvalidPath(_))));
    }

    #[test]
    fn test_validate_rejects_unreachable_cwd() {
        let temp = TempDir::new().unwrap();
        let inner = temp.path().join("inner");
        let sibling = temp.path().join("sibling");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();

        let policy = SandboxPolicy::new(sibling).with_read_write(vec![inner.clone()]);
        assert!(policy.validate().is_err());

        let parent = SandboxPolicy::new(temp.path()).with_read_write(vec![inner]);
        assert!(parent.validate().is_ok());
    }
}
