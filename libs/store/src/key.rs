//! Chunk keys.
//!
//! Keys are opaque strings derived from content hashes. Chunk files and index
//! files live in separate namespaces, distinguished by suffix.

use std::fmt;

/// Suffix for chunk objects.
pub const CHUNK_SUFFIX: &str = ".cacnk";

/// Suffix for index objects.
pub const INDEX_SUFFIX: &str = ".caibx";

/// Identifier of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey(String);

impl ChunkKey {
    /// Wrap an arbitrary key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the chunk with the given content id.
    pub fn chunk(id: &str) -> Self {
        Self(format!("{id}{CHUNK_SUFFIX}"))
    }

    /// Key of the index with the given logical name.
    pub fn index(name: &str) -> Self {
        Self(format!("{name}{INDEX_SUFFIX}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_chunk(&self) -> bool {
        self.0.len() > CHUNK_SUFFIX.len() && self.0.ends_with(CHUNK_SUFFIX)
    }

    pub fn is_index(&self) -> bool {
        self.0.len() > INDEX_SUFFIX.len() && self.0.ends_with(INDEX_SUFFIX)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChunkKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChunkKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ChunkKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_and_index_namespaces() {
        let chunk = ChunkKey::chunk("abc");
        let index = ChunkKey::index("abc");

        assert_eq!(chunk.as_str(), "abc.cacnk");
        assert_eq!(index.as_str(), "abc.caibx");
        assert_ne!(chunk, index);
        assert!(chunk.is_chunk() && !chunk.is_index());
        assert!(index.is_index() && !index.is_chunk());
    }

    #[test]
    fn test_bare_suffix_is_not_a_chunk() {
        assert!(!ChunkKey::new(".cacnk").is_chunk());
    }
}
