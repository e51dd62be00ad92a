//! In-process memory tier.

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;

use crate::error::StoreError;
use crate::key::ChunkKey;
use crate::store::{Capabilities, Store};

/// Default memory budget (1 GiB).
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024 * 1024;

/// Fixed-budget key to bytes cache.
///
/// Replacement is left to the underlying cache; an entry may disappear at any
/// time, which callers see as a plain miss.
pub struct MemoryTier {
    cache: Cache<ChunkKey, Bytes>,
}

impl MemoryTier {
    /// Create a memory tier holding at most `max_bytes` of keys and values.
    pub fn new(max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .weigher(|key: &ChunkKey, value: &Bytes| {
                u32::try_from(key.as_str().len() + value.len()).unwrap_or(u32::MAX)
            })
            .max_capacity(max_bytes)
            .build();
        Self { cache }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

#[async_trait]
impl Store for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_WRITE
    }

    async fn get_chunk(&self, key: &ChunkKey, buf: &mut Vec<u8>) -> Result<(), StoreError> {
        match self.cache.get(key).await {
            Some(value) => {
                buf.clear();
                buf.extend_from_slice(&value);
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn put_chunk(&self, key: &ChunkKey, data: &[u8]) -> Result<(), StoreError> {
        self.cache
            .insert(key.clone(), Bytes::copy_from_slice(data))
            .await;
        Ok(())
    }
}
