//! Ordered tier chain with fallback lookup and background write-back.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::key::ChunkKey;
use crate::store::{Capabilities, Store};

/// Tiers consulted in a fixed order, fastest first.
///
/// The order is set at construction and never changes.
#[derive(Clone)]
pub struct Chain {
    tiers: Arc<[Arc<dyn Store>]>,
}

impl Chain {
    pub fn new(tiers: Vec<Arc<dyn Store>>) -> Self {
        Self {
            tiers: tiers.into(),
        }
    }

    /// Tier names in lookup order.
    pub fn tiers(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Copy `data` into every put-capable tier before `hit`, without waiting.
    fn write_back(&self, hit: usize, key: &ChunkKey, data: &[u8]) {
        let targets: Vec<Arc<dyn Store>> = self.tiers[..hit]
            .iter()
            .filter(|t| t.capabilities().put)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let data = Bytes::copy_from_slice(data);
        for tier in targets {
            let key = key.clone();
            let data = data.clone();
            tokio::spawn(async move {
                match tier.put_chunk(&key, &data).await {
                    Ok(()) => debug!(tier = tier.name(), key = %key, "Wrote back chunk"),
                    Err(e) if e.is_unsupported() => {}
                    Err(e) => warn!(
                        tier = tier.name(),
                        key = %key,
                        reason = e.reason_code(),
                        error = %e,
                        "Chunk write-back failed"
                    ),
                }
            });
        }
    }
}

#[async_trait]
impl Store for Chain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    /// Return the chunk from the first tier that has it.
    ///
    /// Tiers after the hit are not consulted. A tier error is logged and the
    /// scan moves on; if nothing hits, the last such error is returned,
    /// otherwise `NotFound`.
    async fn get_chunk(&self, key: &ChunkKey, buf: &mut Vec<u8>) -> Result<(), StoreError> {
        let mut last_err = None;

        for (i, tier) in self.tiers.iter().enumerate() {
            if !tier.capabilities().get {
                continue;
            }
            match tier.get_chunk(key, buf).await {
                Ok(()) => {
                    self.write_back(i, key, buf);
                    return Ok(());
                }
                Err(e) if e.is_not_found() || e.is_unsupported() => {}
                Err(e) => {
                    warn!(
                        tier = tier.name(),
                        key = %key,
                        reason = e.reason_code(),
                        error = %e,
                        "Chunk lookup failed, trying next tier"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| StoreError::NotFound(key.to_string())))
    }

    async fn put_chunk(&self, _key: &ChunkKey, _data: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::unsupported("chain", "put"))
    }
}
