//! Mount error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure running an external command.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to start {cmd:?}: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{cmd:?} exited with {status}: {stderr}")]
    Status {
        cmd: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// Exit status was clean but the tool complained anyway. `stdout` is
    /// kept since the tool may still have done its work.
    #[error("{cmd:?} wrote to stderr: {stderr}")]
    Stderr {
        cmd: String,
        stdout: String,
        stderr: String,
    },
}

/// Loop device errors.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("not a loop device: {0}")]
    NotLoopDevice(String),
}

/// Errors from the mount lifecycle and its instantiations.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{kind} mount at {target} failed: {detail}")]
    Failed {
        kind: &'static str,
        target: PathBuf,
        detail: String,
    },

    /// The target did not become populated in time. Distinct from `Failed`
    /// so callers can choose to retry with a longer timeout.
    #[error("{kind} mount at {target} not ready after {after:?}")]
    Timeout {
        kind: &'static str,
        target: PathBuf,
        after: Duration,
    },

    #[error("cleanup of {target} failed: {detail}")]
    Cleanup { target: PathBuf, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error("layer error: {0}")]
    Image(#[from] casnap_image::ImageError),

    #[error("index error: {0}")]
    Chunker(#[from] casnap_chunker::ChunkerError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl MountError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "precondition",
            Self::Failed { .. } => "mount_failed",
            Self::Timeout { .. } => "timeout",
            Self::Cleanup { .. } => "cleanup_failed",
            Self::Io(_) => "io_error",
            Self::Exec(_) => "exec_failed",
            Self::Loop(_) => "loop_failed",
            Self::Image(_) => "layer_failed",
            Self::Chunker(_) => "index_failed",
            Self::Task(_) => "task_failed",
        }
    }
}
