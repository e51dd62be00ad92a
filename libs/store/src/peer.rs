//! Peer tier placeholder.
//!
//! Reserved for fetching chunks from other nodes in the cluster. Until that
//! exchange exists the tier supports nothing and every call reports
//! `Unsupported`.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::key::ChunkKey;
use crate::store::{Capabilities, Store};

#[derive(Debug, Default)]
pub struct PeerTier;

impl PeerTier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Store for PeerTier {
    fn name(&self) -> &'static str {
        "peer"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    async fn get_chunk(&self, _key: &ChunkKey, _buf: &mut Vec<u8>) -> Result<(), StoreError> {
        Err(StoreError::unsupported("peer", "get"))
    }

    async fn put_chunk(&self, _key: &ChunkKey, _data: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::unsupported("peer", "put"))
    }
}
