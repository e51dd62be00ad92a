//! Loop device attach/detach through `losetup`.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{ExecError, LoopError};
use crate::exec;

/// A bound loop device such as `/dev/loop3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    path: PathBuf,
}

impl LoopDevice {
    /// Accept only paths of the form `/dev/loop<N>`.
    pub fn parse(path: &str) -> Result<Self, LoopError> {
        let path = path.trim();
        if !is_loop_device_name(path) {
            return Err(LoopError::NotLoopDevice(path.to_string()));
        }
        Ok(Self {
            path: PathBuf::from(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// `/dev/loop` followed by one or more digits.
pub fn is_loop_device_name(path: &str) -> bool {
    path.strip_prefix("/dev/loop")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Loop device manager backed by the `losetup` binary.
#[derive(Debug, Clone)]
pub struct Losetup {
    bin: PathBuf,
}

impl Losetup {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// Bind `file` read-only to a free loop device, creating one if needed.
    pub async fn attach(&self, file: &Path) -> Result<LoopDevice, LoopError> {
        let result = exec::run_strict(
            &self.bin,
            [
                OsStr::new("--find"),
                OsStr::new("--show"),
                OsStr::new("--nooverlap"),
                OsStr::new("--read-only"),
                file.as_os_str(),
            ],
        )
        .await;
        let out = match result {
            Ok(out) => out,
            Err(err) => {
                // A warning can come with a bound device; do not leak it.
                if let ExecError::Stderr { stdout, stderr, .. } = &err {
                    if let Ok(device) = LoopDevice::parse(stdout) {
                        warn!(
                            device = %device,
                            stderr = %stderr,
                            "Detaching after losetup warning"
                        );
                        if let Err(e) = self.detach(&device).await {
                            warn!(device = %device, error = %e, "Failed to detach loop device");
                        }
                    }
                }
                return Err(err.into());
            }
        };
        let device = LoopDevice::parse(&out.stdout)?;
        info!(file = %file.display(), device = %device, "Attached loop device");
        Ok(device)
    }

    /// Release the binding.
    pub async fn detach(&self, device: &LoopDevice) -> Result<(), LoopError> {
        exec::run_strict(&self.bin, [OsStr::new("-d"), device.path().as_os_str()]).await?;
        info!(device = %device, "Detached loop device");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_device_names() {
        assert!(is_loop_device_name("/dev/loop0"));
        assert!(is_loop_device_name("/dev/loop127"));
        assert!(!is_loop_device_name("/dev/loop"));
        assert!(!is_loop_device_name("/dev/loop-control"));
        assert!(!is_loop_device_name("/dev/sda1"));
        assert!(!is_loop_device_name("/dev/loop1p1"));
    }

    #[test]
    fn test_parse_trims_tool_output() {
        let dev = LoopDevice::parse("/dev/loop7\n").unwrap();
        assert_eq!(dev.path(), Path::new("/dev/loop7"));
        assert!(LoopDevice::parse("losetup: cannot find").is_err());
    }

    fn fake_tool(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("losetup");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_attach_with_fake_tool() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_tool(dir.path(), "#!/bin/sh\necho /dev/loop42\n");

        let dev = Losetup::new(&fake)
            .attach(Path::new("/tmp/image.sqfs"))
            .await
            .unwrap();
        assert_eq!(dev.to_string(), "/dev/loop42");
    }

    #[tokio::test]
    async fn test_warning_on_stderr_fails_attach() {
        let dir = tempfile::tempdir().unwrap();
        let fake = fake_tool(
            dir.path(),
            "#!/bin/sh\necho /dev/loop1\necho 'warning' >&2\n",
        );

        let err = Losetup::new(&fake)
            .attach(Path::new("/tmp/image.sqfs"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Exec(_)));
    }
    #[tokio::test]
    async fn test_attach_warning_detaches_bound_device() {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {}\n\
             [ \"$1\" = -d ] && exit 0\n\
             echo /dev/loop9\necho 'losetup: warning' >&2\n",
            calls.display()
        );
        let fake = fake_tool(dir.path(), &script);

        let err = Losetup::new(&fake)
            .attach(Path::new("/tmp/image.sqfs"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Exec(ExecError::Stderr { .. })));

        let calls = std::fs::read_to_string(&calls).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 2, "{calls:?}");
        assert!(calls[0].starts_with("--find"));
        assert_eq!(calls[1], "-d /dev/loop9");
    }
}
