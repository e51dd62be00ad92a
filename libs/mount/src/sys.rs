//! Mount syscalls.
//!
//! Linux-only; other platforms get stubs that always fail.

use std::path::Path;

#[cfg(target_os = "linux")]
use nix::errno::Errno;
#[cfg(target_os = "linux")]
use nix::mount::{mount, umount2, MntFlags, MsFlags};
#[cfg(target_os = "linux")]
use tracing::debug;

use crate::error::MountError;

/// Mount `source` on `target`. Blocks the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn mount_fs(
    kind: &'static str,
    source: &Path,
    target: &Path,
    fstype: &str,
    read_only: bool,
    data: Option<&str>,
) -> Result<(), MountError> {
    let flags = if read_only {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };
    mount(Some(source), target, Some(fstype), flags, data).map_err(|e| MountError::Failed {
        kind,
        target: target.to_path_buf(),
        detail: format!(
            "mount -t {fstype} {} {}{}: {e}",
            source.display(),
            target.display(),
            data.map(|d| format!(" -o {d}")).unwrap_or_default()
        ),
    })
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn mount_fs(
    kind: &'static str,
    _source: &Path,
    target: &Path,
    _fstype: &str,
    _read_only: bool,
    _data: Option<&str>,
) -> Result<(), MountError> {
    Err(MountError::Failed {
        kind,
        target: target.to_path_buf(),
        detail: "mounts are only supported on Linux".to_string(),
    })
}

/// Forcefully and lazily detach whatever is mounted on `target`.
///
/// Nothing mounted there, or no such path, counts as success so release
/// paths can call this more than once.
#[cfg(target_os = "linux")]
pub fn force_detach(target: &Path) -> Result<(), MountError> {
    match umount2(target, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH) {
        Ok(()) => {
            debug!(target = %target.display(), "Detached mount");
            Ok(())
        }
        Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(MountError::Cleanup {
            target: target.to_path_buf(),
            detail: format!("umount: {e}"),
        }),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn force_detach(_target: &Path) -> Result<(), MountError> {
    Ok(())
}

/// Whether the kernel's overlay module understands `index=off`.
pub fn overlay_supports_index_off() -> bool {
    Path::new("/sys/module/overlay/parameters/index").exists()
}
