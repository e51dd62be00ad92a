//! Remote tier: the authoritative copy of every chunk and index.

mod local;
mod s3;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::StoreError;
use crate::key::ChunkKey;
use crate::store::{Capabilities, Store};

pub use local::LocalBackend;
pub use s3::{S3Backend, S3Config};

/// Namespace for chunk objects under the user prefix.
pub const CHUNK_NAMESPACE: &str = "chunk/";
/// Namespace for index objects under the user prefix.
pub const INDEX_NAMESPACE: &str = "index/";

/// Minimal object storage interface.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Store an object, replacing any existing one.
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Fetch an object. A missing key is `Ok(None)`.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), StoreError>;

    async fn exists_object(&self, key: &str) -> Result<bool, StoreError>;
}

/// Which object backend holds the authoritative chunks and indexes.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// A directory tree, for single-host setups and tests.
    Local { root: PathBuf },
    S3(S3Config),
}

impl BackendConfig {
    pub async fn connect(&self) -> Result<Arc<dyn ObjectBackend>, StoreError> {
        match self {
            Self::Local { root } => {
                info!(root = %root.display(), "Using local object backend");
                Ok(Arc::new(LocalBackend::new(root.clone())))
            }
            Self::S3(config) => {
                info!(
                    bucket = %config.bucket,
                    endpoint = config.endpoint.as_deref().unwrap_or("default"),
                    "Using S3 object backend"
                );
                Ok(Arc::new(S3Backend::connect(config.clone()).await?))
            }
        }
    }
}

/// A `Store` over an object backend with a key prefix.
#[derive(Clone)]
pub struct RemoteTier {
    backend: Arc<dyn ObjectBackend>,
    prefix: String,
}

impl RemoteTier {
    /// Wrap a backend, prepending `prefix` verbatim to every key.
    pub fn new(backend: Arc<dyn ObjectBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// Tier over the chunk namespace (`<prefix>chunk/`).
    pub fn chunks(backend: Arc<dyn ObjectBackend>, prefix: &str) -> Self {
        Self::new(backend, format!("{}{CHUNK_NAMESPACE}", normalize_prefix(prefix)))
    }

    /// Tier over the index namespace (`<prefix>index/`).
    pub fn indexes(backend: Arc<dyn ObjectBackend>, prefix: &str) -> Self {
        Self::new(backend, format!("{}{INDEX_NAMESPACE}", normalize_prefix(prefix)))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub async fn delete(&self, key: &ChunkKey) -> Result<(), StoreError> {
        self.backend.delete_object(&self.object_key(key)).await
    }

    pub async fn exists(&self, key: &ChunkKey) -> Result<bool, StoreError> {
        self.backend.exists_object(&self.object_key(key)).await
    }

    fn object_key(&self, key: &ChunkKey) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl Store for RemoteTier {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_WRITE
    }

    async fn get_chunk(&self, key: &ChunkKey, buf: &mut Vec<u8>) -> Result<(), StoreError> {
        match self.backend.get_object(&self.object_key(key)).await? {
            Some(data) => {
                *buf = data;
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn put_chunk(&self, key: &ChunkKey, data: &[u8]) -> Result<(), StoreError> {
        self.backend.put_object(&self.object_key(key), data).await
    }
}

/// Empty stays empty; anything else ends with exactly one `/`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_prefixes() {
        let backend: Arc<dyn ObjectBackend> = Arc::new(LocalBackend::new("/nonexistent"));

        assert_eq!(RemoteTier::chunks(backend.clone(), "").prefix(), "chunk/");
        assert_eq!(
            RemoteTier::indexes(backend.clone(), "team/").prefix(),
            "team/index/"
        );
        assert_eq!(RemoteTier::chunks(backend, "/a/b").prefix(), "a/b/chunk/");
    }

    #[tokio::test]
    async fn test_local_backend_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::Local {
            root: dir.path().to_path_buf(),
        };
        let tier = RemoteTier::chunks(config.connect().await.unwrap(), "");

        let key = ChunkKey::chunk("abc");
        tier.put_chunk(&key, b"payload").await.unwrap();
        let mut buf = Vec::new();
        tier.get_chunk(&key, &mut buf).await.unwrap();
        assert_eq!(buf, b"payload");
        assert!(dir.path().join("chunk/abc.cacnk").exists());
    }
}
