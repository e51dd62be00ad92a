use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from OCI registry operations.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required for {0}")]
    AuthRequired(String),

    #[error("Blob too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Unexpected registry response to {op}: {status}")]
    Status {
        op: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("Invalid registry response: {0}")]
    Protocol(String),

    #[error("Unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Request timeout")]
    Timeout,
}

/// Errors from image handling.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Invalid image reference {input:?}: {reason}")]
    InvalidReference { input: String, reason: String },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Oci(#[from] OciError),

    #[error("Invalid tarball {path}: {detail}")]
    Tarball { path: PathBuf, detail: String },

    #[error("Failed to unpack {path}: {detail}")]
    Unpack { path: PathBuf, detail: String },

    #[error("Invalid seed image: {0}")]
    Seed(String),

    #[error("Image config lists {diff_ids} diff ids for {layers} layers")]
    DiffIdCount { layers: usize, diff_ids: usize },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ImageError {
    pub(crate) fn reference(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn tarball(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::Tarball {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Oci(OciError::NotFound(_)))
    }
}
