//! Advisory file lock shared with other processes using the same cache root.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use fs2::FileExt;

/// A held `flock` on the cache lock file. Released on drop.
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    /// Take a shared lock, blocking a worker thread until it is granted.
    pub(crate) async fn shared(path: PathBuf) -> io::Result<Self> {
        Self::acquire(path, false).await
    }

    /// Take an exclusive lock, blocking a worker thread until it is granted.
    pub(crate) async fn exclusive(path: PathBuf) -> io::Result<Self> {
        Self::acquire(path, true).await
    }

    async fn acquire(path: PathBuf, exclusive: bool) -> io::Result<Self> {
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            if exclusive {
                FileExt::lock_exclusive(&file)?;
            } else {
                FileExt::lock_shared(&file)?;
            }
            Ok(Self { file })
        })
        .await
        .map_err(io::Error::other)?
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
