//! Store error taxonomy.

use thiserror::Error;

/// Errors from chunk store operations.
///
/// `NotFound` and `Unsupported` are expected outcomes that drive tier
/// fallback; everything else is a real failure on the path that produced it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such chunk: {0}")]
    NotFound(String),

    #[error("{tier} tier does not support {op}")]
    Unsupported {
        tier: &'static str,
        op: &'static str,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    Backend(String),

    #[error("corrupt data for {key}: {detail}")]
    Corrupt { key: String, detail: String },

    /// The chunk alone exceeds the tier's byte budget.
    #[error("{key} is {size} bytes, over the {max} byte budget")]
    TooLarge { key: String, size: u64, max: u64 },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn unsupported(tier: &'static str, op: &'static str) -> Self {
        Self::Unsupported { tier, op }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Short machine-readable code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unsupported { .. } => "unsupported",
            Self::InvalidKey(_) => "invalid_key",
            Self::Io(_) => "io_error",
            Self::Backend(_) => "backend_error",
            Self::Corrupt { .. } => "corrupt",
            Self::TooLarge { .. } => "too_large",
            Self::Task(_) => "task_failed",
        }
    }
}
