//! Path confinement helpers.
//!
//! Everything placed inside a worktree, or handed to the sandbox as an
//! allow-list entry, must resolve under a known root. Resolution is lexical:
//! symlinks are not followed, `..` may not climb above the root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, VcsError};

/// Join a relative path onto `root`, rejecting absolute paths and any `..`
/// that would escape it.
pub fn resolve_under(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(VcsError::InvalidPath(format!(
                        "{} escapes {}",
                        rel.display(),
                        root.display()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(VcsError::InvalidPath(format!(
                    "{} must be relative to {}",
                    rel.display(),
                    root.display()
                )));
            }
        }
    }
    Ok(root.join(resolved))
}

/// Express `path` (absolute, or relative to `root`) as a path relative to
/// `root`, failing when it lies outside.
pub fn relative_to(root: &Path, path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        let stripped = path.strip_prefix(root).map_err(|_| {
            VcsError::InvalidPath(format!(
                "{} is not under repository root {}",
                path.display(),
                root.display()
            ))
        })?;
        let resolved = resolve_under(root, stripped)?;
        Ok(resolved.strip_prefix(root).unwrap_or(stripped).to_path_buf())
    } else {
        let resolved = resolve_under(root, path)?;
        Ok(resolved.strip_prefix(root).unwrap_or(path).to_path_buf())
    }
}

/// Replace `dst` with a copy of `src` (file or directory tree).
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if !src.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source path does not exist: {}", src.display()),
        ));
    }

    if dst.is_dir() {
        fs::remove_dir_all(dst)?;
    } else if dst.exists() {
        fs::remove_file(dst)?;
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    if src.is_dir() {
        copy_dir(src, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
        // Symlinks are not copied.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_under_accepts_nested_paths() {
        let root = Path::new("/repo");
        assert_eq!(
            resolve_under(root, Path::new("papers/./p1")).unwrap(),
            PathBuf::from("/repo/papers/p1")
        );
        assert_eq!(
            resolve_under(root, Path::new("a/../b")).unwrap(),
            PathBuf::from("/repo/b")
        );
    }

    #[test]
    fn test_resolve_under_rejects_escapes() {
        let root = Path::new("/repo");
        assert!(resolve_under(root, Path::new("../etc")).is_err());
        assert!(resolve_under(root, Path::new("a/../../etc")).is_err());
        assert!(resolve_under(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_relative_to() {
        let root = Path::new("/repo");
        assert_eq!(
            relative_to(root, Path::new("/repo/papers/p1")).unwrap(),
            PathBuf::from("papers/p1")
        );
        assert_eq!(
            relative_to(root, Path::new("papers/p1")).unwrap(),
            PathBuf::from("papers/p1")
        );
        assert!(relative_to(root, Path::new("/elsewhere/p1")).is_err());
    }

    #[test]
    fn test_copy_tree_replaces_destination() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("nested/b.txt"), "b").unwrap();

        let dst = temp.path().join("dst");
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("stale.txt"), "old").unwrap();

        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt")).unwrap(), "b");
        assert!(!dst.join("stale.txt").exists());
    }

    #[test]
    fn test_copy_tree_missing_source() {
        let temp = tempfile::tempdir().unwrap();
        let err = copy_tree(&temp.path().join("missing"), &temp.path().join("dst")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
