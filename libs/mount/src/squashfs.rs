//! Read-only squashfs mounts over loop devices, and image creation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::MountError;
use crate::exec;
use crate::lifecycle::{self, MountHandle, MountOptions, Mounter};
use crate::loopdev::{is_loop_device_name, LoopDevice, Losetup};
use crate::sys;

/// `mksquashfs` flags producing an uncompressed, unfragmented,
/// non-deduplicated image, so chunking sees file contents verbatim.
pub const MKSQUASHFS_OPTS: &[&str] = &[
    "-noI",
    "-noD",
    "-noF",
    "-noX",
    "-no-fragments",
    "-no-duplicates",
];

/// Build a squashfs image of `src` at `dst`. `dst` must not exist, since
/// `mksquashfs` would append to it.
pub async fn make_squashfs(
    bin: &Path,
    src: &Path,
    dst: &Path,
    opts: &[&str],
) -> Result<(), MountError> {
    if tokio::fs::try_exists(dst).await? {
        return Err(MountError::Precondition(format!(
            "{} already exists",
            dst.display()
        )));
    }
    let mut args: Vec<&std::ffi::OsStr> = vec![src.as_os_str(), dst.as_os_str()];
    args.extend(opts.iter().map(std::ffi::OsStr::new));
    // mksquashfs reports some unreadable source files on stderr only.
    exec::run_strict(bin, args).await?;
    info!(src = %src.display(), dst = %dst.display(), "Built squashfs image");
    Ok(())
}

pub struct SquashfsMounter {
    device: PathBuf,
    target: PathBuf,
    /// Loop device attached on our behalf, detached on release.
    owned_loop: Mutex<Option<(Losetup, LoopDevice)>>,
}

impl SquashfsMounter {
    /// Mount an already attached loop `device`.
    pub fn new(device: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            target: target.into(),
            owned_loop: Mutex::new(None),
        }
    }

    fn with_owned_loop(losetup: Losetup, device: LoopDevice, target: &Path) -> Self {
        Self {
            device: device.path().to_path_buf(),
            target: target.to_path_buf(),
            owned_loop: Mutex::new(Some((losetup, device))),
        }
    }

    /// Detach the owned loop device, if still attached.
    async fn detach_loop(&self) -> Result<(), MountError> {
        let owned = match self.owned_loop.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((losetup, device)) = owned {
            losetup.detach(&device).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Mounter for SquashfsMounter {
    fn kind(&self) -> &'static str {
        "squashfs"
    }

    fn target(&self) -> &Path {
        &self.target
    }

    async fn prepare(&self) -> Result<(), MountError> {
        let name = self.device.to_string_lossy();
        if !is_loop_device_name(&name) || !tokio::fs::try_exists(&self.device).await? {
            return Err(MountError::Precondition(format!(
                "expected {name} to be a loop device"
            )));
        }
        Ok(())
    }

    async fn mount(&self) -> Result<(), MountError> {
        let device = self.device.clone();
        let target = self.target.clone();
        tokio::task::spawn_blocking(move || {
            sys::mount_fs("squashfs", &device, &target, "squashfs", true, None)
        })
        .await?
    }

    async fn release(&self) -> Result<(), MountError> {
        sys::force_detach(&self.target)?;
        self.detach_loop().await
    }
}

/// Attach `file` to a loop device and mount it read-only at `target`.
///
/// The loop device is detached by the handle's unmount, and on every path
/// where no handle is returned.
pub async fn mount_squashfs_file(
    losetup: &Losetup,
    file: &Path,
    target: &Path,
    opts: MountOptions,
) -> Result<MountHandle, MountError> {
    if !tokio::fs::metadata(file).await?.is_file() {
        return Err(MountError::Precondition(format!(
            "{} is not a regular file",
            file.display()
        )));
    }

    let device = losetup.attach(file).await?;
    let mounter = Arc::new(SquashfsMounter::with_owned_loop(
        losetup.clone(),
        device,
        target,
    ));

    match lifecycle::mount(mounter.clone(), opts).await {
        Ok(handle) => Ok(handle),
        Err(e) => {
            // Precondition failures never reach release; the loop device is
            // still ours to detach.
            if let Err(detach_err) = mounter.detach_loop().await {
                warn!(error = %detach_err, "Failed to detach loop device");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;

    fn fake_mksquashfs(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("mksquashfs");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_make_squashfs_passes_options() {
        let dir = tempfile::tempdir().unwrap();
        let args = dir.path().join("args");
        let fake = fake_mksquashfs(
            dir.path(),
            &format!("#!/bin/sh\necho \"$@\" > {}\n", args.display()),
        );

        let dst = dir.path().join("out.sqfs");
        make_squashfs(&fake, Path::new("/src"), &dst, &["-noI", "-no-fragments"])
            .await
            .unwrap();
        let recorded = std::fs::read_to_string(&args).unwrap();
        assert_eq!(
            recorded.trim(),
            format!("/src {} -noI -no-fragments", dst.display())
        );
    }

    #[tokio::test]
    async fn test_make_squashfs_fails_on_stderr_with_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_mksquashfs(
            dir.path(),
            "#!/bin/sh\necho 'Failed to read file /src/etc/shadow' >&2\nexit 0\n",
        );

        let err = make_squashfs(&fake, Path::new("/src"), &dir.path().join("out.sqfs"), &[])
            .await
            .unwrap_err();
        match err {
            MountError::Exec(ExecError::Stderr { stderr, .. }) => {
                assert!(stderr.contains("shadow"), "{stderr}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_make_squashfs_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_mksquashfs(dir.path(), "#!/bin/sh\nexit 0\n");
        let dst = dir.path().join("out.sqfs");
        std::fs::write(&dst, b"old").unwrap();

        let err = make_squashfs(&fake, Path::new("/src"), &dst, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MountError::Precondition(_)));
    }
}
