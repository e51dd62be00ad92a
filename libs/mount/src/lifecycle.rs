//! Async mount lifecycle.
//!
//! Every mount kind goes through the same steps:
//!
//! 1. check the target is absent or an empty directory
//! 2. `prepare` the mount (scratch dirs, unpacking), awaited without a deadline
//! 3. dispatch `mount` on a background task
//! 4. poll the target until it has entries, racing the poll against the
//!    operation's own failure and an overall deadline
//!
//! On failure or timeout the mounter is released before the error is
//! returned. A mount operation that finishes after the caller already gave up
//! releases itself. A failure reported after a handle was returned is
//! delivered through [`MountHandle::failed`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::MountError;
use crate::fsutil;

/// Readiness polling parameters.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

impl MountOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// One kind of mount, driven by [`mount`].
#[async_trait]
pub trait Mounter: Send + Sync + 'static {
    /// Short name for logs and errors.
    fn kind(&self) -> &'static str;

    /// Directory that becomes populated once the mount is live.
    fn target(&self) -> &Path;

    /// Work that must finish before the mount is dispatched.
    async fn prepare(&self) -> Result<(), MountError> {
        Ok(())
    }

    /// Perform the mount. Runs on a background task; may outlive the wait.
    async fn mount(&self) -> Result<(), MountError>;

    /// Undo `prepare` and `mount`. Must tolerate being called more than once
    /// and after a partial or failed mount.
    async fn release(&self) -> Result<(), MountError>;
}

/// A live mount.
///
/// Dropping the handle does not unmount; call [`MountHandle::unmount`].
pub struct MountHandle {
    target: PathBuf,
    mounter: Arc<dyn Mounter>,
    failure: Option<oneshot::Receiver<MountError>>,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("kind", &self.mounter.kind())
            .field("target", &self.target)
            .finish()
    }
}

impl MountHandle {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn kind(&self) -> &'static str {
        self.mounter.kind()
    }

    /// Wait for a failure reported after the mount was declared ready.
    ///
    /// Resolves at most once with `Some(error)`. Resolves `None` when no
    /// failure can arrive any more: the operation finished cleanly, or the
    /// failure was already taken.
    pub async fn failed(&mut self) -> Option<MountError> {
        let rx = self.failure.as_mut()?;
        let result = rx.await.ok();
        self.failure = None;
        result
    }

    /// Detach the mount and release its resources.
    pub async fn unmount(mut self) -> Result<(), MountError> {
        // Closing the channel: no further failures are reported.
        self.failure = None;
        let result = self.mounter.release().await;
        match &result {
            Ok(()) => info!(kind = self.kind(), target = %self.target.display(), "Unmounted"),
            Err(e) => error!(
                kind = self.kind(),
                target = %self.target.display(),
                error = %e,
                "Unmount failed"
            ),
        }
        result
    }
}

/// Bring up `mounter` and wait for it to become ready.
pub async fn mount(
    mounter: Arc<dyn Mounter>,
    opts: MountOptions,
) -> Result<MountHandle, MountError> {
    let kind = mounter.kind();
    let target = mounter.target().to_path_buf();

    fsutil::prepare_target(&target).await?;

    if let Err(e) = mounter.prepare().await {
        release_after_failure(mounter.as_ref()).await;
        return Err(e);
    }

    let abandoned = Arc::new(AtomicBool::new(false));
    let (failure_tx, failure_rx) = oneshot::channel();
    {
        let mounter = mounter.clone();
        let abandoned = abandoned.clone();
        tokio::spawn(async move {
            // An inner task turns a panic in `mount` into a JoinError instead
            // of a silently closed channel.
            let operation = {
                let mounter = mounter.clone();
                tokio::spawn(async move { mounter.mount().await })
            };
            let outcome = match operation.await {
                Ok(outcome) => outcome,
                Err(join) => {
                    error!(
                        kind = mounter.kind(),
                        target = %mounter.target().display(),
                        error = %join,
                        "Mount operation panicked"
                    );
                    Err(MountError::Task(join))
                }
            };
            match outcome {
                Ok(()) => {
                    if abandoned.load(Ordering::SeqCst) {
                        warn!(
                            kind = mounter.kind(),
                            target = %mounter.target().display(),
                            "Mount completed after the wait was abandoned, releasing"
                        );
                        release_after_failure(mounter.as_ref()).await;
                    }
                    // failure_tx drops here, closing the channel.
                }
                Err(e) => {
                    let _ = failure_tx.send(e);
                }
            }
        });
    }

    let mut failure = Some(failure_rx);
    let mut ticker = tokio::time::interval(opts.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(opts.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if fsutil::is_populated_dir(&target).await {
                    info!(kind, target = %target.display(), "Mounted");
                    return Ok(MountHandle {
                        target,
                        mounter,
                        failure,
                    });
                }
            }
            result = recv_failure(&mut failure), if failure.is_some() => {
                match result {
                    Some(e) => {
                        warn!(kind, target = %target.display(), error = %e, "Mount failed");
                        release_after_failure(mounter.as_ref()).await;
                        return Err(e);
                    }
                    // Operation returned cleanly; keep polling for readiness.
                    None => debug!(kind, target = %target.display(), "Mount operation finished"),
                }
            }
            _ = &mut deadline => {
                abandoned.store(true, Ordering::SeqCst);
                warn!(
                    kind,
                    target = %target.display(),
                    timeout_secs = opts.timeout.as_secs_f64(),
                    "Mount not ready before timeout"
                );
                release_after_failure(mounter.as_ref()).await;
                return Err(MountError::Timeout {
                    kind,
                    target,
                    after: opts.timeout,
                });
            }
        }
    }
}

async fn recv_failure(rx: &mut Option<oneshot::Receiver<MountError>>) -> Option<MountError> {
    let Some(inner) = rx.as_mut() else {
        return std::future::pending().await;
    };
    let result = inner.await.ok();
    *rx = None;
    result
}

/// Release on an error path. Cleanup errors are logged and never replace
/// the error being returned.
async fn release_after_failure(mounter: &dyn Mounter) {
    if let Err(e) = mounter.release().await {
        error!(
            kind = mounter.kind(),
            target = %mounter.target().display(),
            error = %e,
            "Failed to release mount"
        );
    }
}
