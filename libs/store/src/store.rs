//! The store capability trait shared by every tier.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::key::ChunkKey;

/// Which operations a store implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub get: bool,
    pub put: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        get: false,
        put: false,
    };
    pub const READ_ONLY: Self = Self {
        get: true,
        put: false,
    };
    pub const READ_WRITE: Self = Self {
        get: true,
        put: true,
    };
}

/// Get/put access to chunks by key.
///
/// An operation outside `capabilities()` returns `StoreError::Unsupported`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Tier name used in logs.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Read the chunk into `buf`, replacing its contents.
    ///
    /// A missing key is `StoreError::NotFound`. The buffer's capacity is
    /// reused when it is large enough.
    async fn get_chunk(&self, key: &ChunkKey, buf: &mut Vec<u8>) -> Result<(), StoreError>;

    /// Store the chunk. Writing an existing key is harmless.
    async fn put_chunk(&self, key: &ChunkKey, data: &[u8]) -> Result<(), StoreError>;
}
