//! Tiered chunk cache.
//!
//! Chunks are looked up across an ordered set of tiers, fastest first:
//!
//! ```text
//! Chain
//! ├── MemoryTier   (in-process, bounded, never authoritative)
//! ├── DiskTier     (local files, LRU-evicted to a byte budget)
//! ├── PeerTier     (placeholder for cluster-local fetch)
//! └── RemoteTier   (object storage, source of truth)
//! ```
//!
//! A hit in a slower tier is copied back into every faster tier in the
//! background; the caller never waits on that promotion.
//!
//! ## Modules
//!
//! - `key`: chunk and index key namespaces
//! - `store`: the `Store` capability trait
//! - `chain`: fallback lookup and write-back
//! - `memory`, `disk`, `peer`, `remote`: tier implementations

pub mod chain;
pub mod disk;
pub mod error;
pub mod key;
pub mod memory;
pub mod peer;
pub mod remote;
pub mod store;

pub use chain::Chain;
pub use disk::{DiskTier, DiskTierConfig, ReconcileReport};
pub use error::StoreError;
pub use key::{ChunkKey, CHUNK_SUFFIX, INDEX_SUFFIX};
pub use memory::MemoryTier;
pub use peer::PeerTier;
pub use remote::{BackendConfig, LocalBackend, ObjectBackend, RemoteTier, S3Backend, S3Config};
pub use store::{Capabilities, Store};
