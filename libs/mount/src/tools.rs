//! Locating the external binaries.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::MountError;
use crate::fsutil::is_executable;
use crate::loopdev::Losetup;
use crate::squashfs::{make_squashfs, MKSQUASHFS_OPTS};

/// Resolved paths of `mksquashfs` and `losetup`.
#[derive(Debug, Clone)]
pub struct Tools {
    pub mksquashfs: PathBuf,
    pub losetup: PathBuf,
}

impl Tools {
    /// Use the given overrides, or search `PATH`. Both must be executable.
    pub fn discover(
        mksquashfs: Option<PathBuf>,
        losetup: Option<PathBuf>,
    ) -> Result<Self, MountError> {
        Ok(Self {
            mksquashfs: resolve("mksquashfs", mksquashfs)?,
            losetup: resolve("losetup", losetup)?,
        })
    }

    pub fn losetup(&self) -> Losetup {
        Losetup::new(&self.losetup)
    }

    /// Build an image suitable for chunking.
    pub async fn make_squashfs(&self, src: &Path, dst: &Path) -> Result<(), MountError> {
        make_squashfs(&self.mksquashfs, src, dst, MKSQUASHFS_OPTS).await
    }
}

fn resolve(name: &str, explicit: Option<PathBuf>) -> Result<PathBuf, MountError> {
    let path = match explicit {
        Some(path) => path,
        None => search_path(name).ok_or_else(|| {
            MountError::Precondition(format!(
                "{name} not found in PATH, pass its location explicitly"
            ))
        })?,
    };
    if !is_executable(&path) {
        return Err(MountError::Precondition(format!(
            "{} is not an executable file",
            path.display()
        )));
    }
    debug!(tool = name, path = %path.display(), "Resolved tool");
    Ok(path)
}

fn search_path(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}
