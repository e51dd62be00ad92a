//! Filesystem helpers shared by the mount kinds.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::warn;

use crate::error::MountError;

/// Whether `path` is a directory with no entries. Unreadable or missing
/// paths are not empty.
pub async fn is_empty_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

/// Whether `path` is a directory with at least one entry.
pub async fn is_populated_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// Make sure `target` can be mounted on: create it when absent, otherwise
/// it must be an empty directory.
pub async fn prepare_target(target: &Path) -> Result<(), MountError> {
    match tokio::fs::metadata(target).await {
        Ok(meta) if !meta.is_dir() => Err(MountError::Precondition(format!(
            "{} is not a directory",
            target.display()
        ))),
        Ok(_) if !is_empty_dir(target).await => Err(MountError::Precondition(format!(
            "{} is not empty",
            target.display()
        ))),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(target).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_all(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Regular file with at least one execute bit set.
pub fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Cannot stat");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_target_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b");

        prepare_target(&target).await.unwrap();
        assert!(is_empty_dir(&target).await);
    }

    #[tokio::test]
    async fn test_prepare_target_rejects_populated_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();

        assert!(matches!(
            prepare_target(dir.path()).await,
            Err(MountError::Precondition(_))
        ));
        assert!(is_populated_dir(dir.path()).await);
    }

    #[tokio::test]
    async fn test_prepare_target_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();

        assert!(prepare_target(&file).await.is_err());
    }

    #[test]
    fn test_is_executable() {
        assert!(is_executable(Path::new("/bin/sh")));
        assert!(!is_executable(Path::new("/etc/hostname-does-not-exist")));
    }
}
