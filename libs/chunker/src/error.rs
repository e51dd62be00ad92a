use casnap_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("invalid chunk size policy {input:?}: {reason}")]
    InvalidPolicy { input: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk store error: {0}")]
    Store(#[from] StoreError),

    #[error("malformed index: {0}")]
    Index(#[from] serde_json::Error),

    #[error("unsupported index version {0}")]
    UnsupportedVersion(u32),

    #[error("chunk {id} failed verification: {detail}")]
    Verify { id: String, detail: String },

    #[error("chunking failed: {0}")]
    Cdc(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ChunkerError {
    pub(crate) fn policy(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
