//! Chunk index format.
//!
//! An index is a JSON document listing the chunks of one file in order:
//!
//! ```json
//! {"version":1,"chunk_size":{"min":16384,"avg":65536,"max":262144},
//!  "size":1234,"chunks":[{"id":"<sha256 hex>","offset":0,"size":1234}]}
//! ```

use casnap_store::{ChunkKey, Store};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ChunkerError;
use crate::policy::ChunkSizePolicy;

pub const INDEX_VERSION: u32 = 1;

/// Lowercase hex SHA-256 of `data`.
pub fn chunk_id(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChunk {
    pub id: String,
    pub offset: u64,
    pub size: u64,
}

impl IndexChunk {
    pub fn key(&self) -> ChunkKey {
        ChunkKey::chunk(&self.id)
    }

    /// Byte after the last byte of this chunk.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u32,
    pub chunk_size: ChunkSizePolicy,
    /// Total size of the reassembled file.
    pub size: u64,
    pub chunks: Vec<IndexChunk>,
}

impl Index {
    pub fn new(chunk_size: ChunkSizePolicy) -> Self {
        Self {
            version: INDEX_VERSION,
            chunk_size,
            size: 0,
            chunks: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChunkerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and check that chunks tile the file without gaps, and that no
    /// chunk is larger than the policy allows.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ChunkerError> {
        let index: Self = serde_json::from_slice(data)?;
        if index.version != INDEX_VERSION {
            return Err(ChunkerError::UnsupportedVersion(index.version));
        }
        index.chunk_size.validate(&index.chunk_size.to_string())?;

        let max = u64::from(index.chunk_size.max);
        let mut expected = 0u64;
        for chunk in &index.chunks {
            if chunk.size == 0 || chunk.size > max {
                return Err(ChunkerError::Verify {
                    id: chunk.id.clone(),
                    detail: format!("size {} outside 1..={max}", chunk.size),
                });
            }
            if chunk.offset != expected {
                return Err(ChunkerError::Verify {
                    id: chunk.id.clone(),
                    detail: format!("offset {} but expected {expected}", chunk.offset),
                });
            }
            expected = expected
                .checked_add(chunk.size)
                .ok_or_else(|| ChunkerError::Verify {
                    id: chunk.id.clone(),
                    detail: "chunk offsets overflow".to_string(),
                })?;
        }
        if expected != index.size {
            return Err(ChunkerError::Verify {
                id: String::new(),
                detail: format!("chunks cover {expected} bytes, index says {}", index.size),
            });
        }
        Ok(index)
    }
}

/// Store `index` under `ChunkKey::index(name)`.
pub async fn store_index(
    store: &dyn Store,
    name: &str,
    index: &Index,
) -> Result<(), ChunkerError> {
    let key = ChunkKey::index(name);
    store.put_chunk(&key, &index.to_bytes()?).await?;
    debug!(key = %key, chunks = index.chunks.len(), "Stored index");
    Ok(())
}

/// Load the index stored under `ChunkKey::index(name)`.
pub async fn load_index(store: &dyn Store, name: &str) -> Result<Index, ChunkerError> {
    let key = ChunkKey::index(name);
    let mut buf = Vec::new();
    store.get_chunk(&key, &mut buf).await?;
    Index::from_bytes(&buf)
}
