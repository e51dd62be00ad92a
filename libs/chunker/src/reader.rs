//! Random access into an indexed file without rebuilding it.

use std::sync::{Arc, Mutex, PoisonError};

use casnap_store::Store;

use crate::assemble::fetch;
use crate::error::ChunkerError;
use crate::index::Index;

/// Reads byte ranges of the file an [`Index`] describes, fetching only the
/// chunks the range touches.
///
/// The most recently fetched chunk is kept, so sequential reads smaller
/// than a chunk cost one store lookup per chunk.
pub struct IndexReader {
    index: Index,
    store: Arc<dyn Store>,
    verify: bool,
    recent: Mutex<Option<(usize, Arc<Vec<u8>>)>>,
}

impl IndexReader {
    pub fn new(index: Index, store: Arc<dyn Store>, verify: bool) -> Self {
        Self {
            index,
            store,
            verify,
            recent: Mutex::new(None),
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Size of the file.
    pub fn size(&self) -> u64 {
        self.index.size
    }

    /// Read up to `len` bytes starting at `offset`. The result is shorter
    /// than `len` only at the end of the file, and empty past it.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, ChunkerError> {
        let end = offset.saturating_add(len as u64).min(self.index.size);
        if offset >= end {
            return Ok(Vec::new());
        }

        let chunks = &self.index.chunks;
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = chunks.partition_point(|c| c.end() <= offset);
        while pos < chunks.len() && chunks[pos].offset < end {
            let chunk = &chunks[pos];
            let data = self.chunk(pos).await?;
            let from = offset.saturating_sub(chunk.offset) as usize;
            let to = (end.min(chunk.end()) - chunk.offset) as usize;
            out.extend_from_slice(&data[from..to]);
            pos += 1;
        }
        Ok(out)
    }

    async fn chunk(&self, pos: usize) -> Result<Arc<Vec<u8>>, ChunkerError> {
        if let Some((cached, data)) = self.lock_recent().as_ref() {
            if *cached == pos {
                return Ok(data.clone());
            }
        }
        let data = Arc::new(
            fetch(self.store.as_ref(), self.index.chunks[pos].clone(), self.verify).await?,
        );
        *self.lock_recent() = Some((pos, data.clone()));
        Ok(data)
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, Option<(usize, Arc<Vec<u8>>)>> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
