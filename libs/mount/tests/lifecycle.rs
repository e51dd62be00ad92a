//! Mount lifecycle state machine, driven by scripted mounters.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use casnap_mount::{mount, MountError, MountOptions, Mounter};

#[derive(Clone, Copy)]
enum Script {
    /// Populate the target after a delay.
    Populate(Duration),
    /// Return success without ever populating.
    Never,
    /// Fail immediately.
    Fail,
    /// Populate, then report failure.
    FailAfterReady,
    /// Populate long after the caller gave up.
    Late(Duration),
    /// Panic, optionally after populating.
    Panic { ready_first: bool },
}

struct Scripted {
    target: PathBuf,
    script: Script,
    releases: AtomicUsize,
}

impl Scripted {
    fn new(target: &Path, script: Script) -> Arc<Self> {
        Arc::new(Self {
            target: target.to_path_buf(),
            script,
            releases: AtomicUsize::new(0),
        })
    }

    fn marker(&self) -> PathBuf {
        self.target.join("ready")
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    async fn populate(&self) {
        tokio::fs::write(self.marker(), b"x").await.unwrap();
    }
}

#[async_trait]
impl Mounter for Scripted {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn target(&self) -> &Path {
        &self.target
    }

    async fn mount(&self) -> Result<(), MountError> {
        match self.script {
            Script::Populate(delay) => {
                tokio::time::sleep(delay).await;
                self.populate().await;
                Ok(())
            }
            Script::Never => Ok(()),
            Script::Fail => Err(MountError::Failed {
                kind: "scripted",
                target: self.target.clone(),
                detail: "boom".to_string(),
            }),
            Script::FailAfterReady => {
                self.populate().await;
                tokio::time::sleep(Duration::from_millis(150)).await;
                Err(MountError::Failed {
                    kind: "scripted",
                    target: self.target.clone(),
                    detail: "late".to_string(),
                })
            }
            Script::Late(delay) => {
                tokio::time::sleep(delay).await;
                self.populate().await;
                Ok(())
            }
            Script::Panic { ready_first } => {
                if ready_first {
                    self.populate().await;
                    tokio::time::sleep(Duration::from_millis(150)).await;
                }
                panic!("scripted mounter crashed");
            }
        }
    }

    async fn release(&self) -> Result<(), MountError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        match tokio::fs::remove_file(self.marker()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn fast_opts() -> MountOptions {
    MountOptions {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(300),
    }
}

#[tokio::test]
async fn test_ready_within_timeout_returns_handle() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("mnt");
    let mounter = Scripted::new(&target, Script::Populate(Duration::from_millis(30)));

    let mut handle = mount(mounter.clone(), fast_opts()).await.unwrap();
    assert_eq!(handle.target(), target.as_path());
    assert_eq!(handle.kind(), "scripted");
    assert_eq!(mounter.releases(), 0);

    // A clean mount never reports a failure.
    assert!(handle.failed().await.is_none());

    handle.unmount().await.unwrap();
    assert_eq!(mounter.releases(), 1);
    assert!(!mounter.marker().exists());
}

#[tokio::test]
async fn test_never_ready_times_out_and_releases() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("mnt");
    let mounter = Scripted::new(&target, Script::Never);

    let err = mount(mounter.clone(), fast_opts()).await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(mounter.releases(), 1);

    // Releasing again is harmless and the target is left empty.
    mounter.release().await.unwrap();
    assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
}

#[tokio::test]
async fn test_mount_failure_is_returned_after_release() {
    let dir = tempfile::tempdir().unwrap();
    let mounter = Scripted::new(&dir.path().join("mnt"), Script::Fail);

    let err = mount(mounter.clone(), fast_opts()).await.unwrap_err();
    assert!(matches!(err, MountError::Failed { ref detail, .. } if detail == "boom"));
    assert_eq!(mounter.releases(), 1);
}

#[tokio::test]
async fn test_failure_after_ready_arrives_on_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mounter = Scripted::new(&dir.path().join("mnt"), Script::FailAfterReady);

    let mut handle = mount(mounter.clone(), fast_opts()).await.unwrap();
    let late = tokio::time::timeout(Duration::from_secs(5), handle.failed())
        .await
        .unwrap();
    assert!(matches!(late, Some(MountError::Failed { .. })));

    // Fires at most once.
    assert!(handle.failed().await.is_none());
    handle.unmount().await.unwrap();
}

#[tokio::test]
async fn test_panicking_mount_is_a_task_failure_not_a_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mounter = Scripted::new(
        &dir.path().join("mnt"),
        Script::Panic { ready_first: false },
    );

    let started = std::time::Instant::now();
    let err = mount(mounter.clone(), fast_opts()).await.unwrap_err();
    assert!(matches!(err, MountError::Task(_)), "{err}");
    assert!(!err.is_timeout());
    assert!(started.elapsed() < fast_opts().timeout);
    assert_eq!(mounter.releases(), 1);
}

#[tokio::test]
async fn test_panic_after_ready_arrives_on_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mounter = Scripted::new(
        &dir.path().join("mnt"),
        Script::Panic { ready_first: true },
    );

    let mut handle = mount(mounter.clone(), fast_opts()).await.unwrap();
    let late = tokio::time::timeout(Duration::from_secs(5), handle.failed())
        .await
        .unwrap();
    assert!(matches!(late, Some(MountError::Task(_))));
    handle.unmount().await.unwrap();
}

#[tokio::test]
async fn test_late_completion_releases_itself() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("mnt");
    let mounter = Scripted::new(&target, Script::Late(Duration::from_millis(500)));

    let err = mount(mounter.clone(), fast_opts()).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(mounter.releases(), 1);

    for _ in 0..200 {
        if mounter.releases() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(mounter.releases(), 2);
    assert!(!mounter.marker().exists());
}

#[tokio::test]
async fn test_populated_target_is_rejected_without_release() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("existing"), b"x").unwrap();
    let mounter = Scripted::new(dir.path(), Script::Populate(Duration::ZERO));

    let err = mount(mounter.clone(), fast_opts()).await.unwrap_err();
    assert!(matches!(err, MountError::Precondition(_)));
    assert_eq!(mounter.releases(), 0);
}
