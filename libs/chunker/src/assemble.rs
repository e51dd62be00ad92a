//! Rebuild a file from its index.

use std::path::Path;
use std::sync::Arc;

use casnap_store::Store;
use fastcdc::v2020;
use futures_util::{stream, StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::ChunkerError;
use crate::index::{chunk_id, Index, IndexChunk};

/// Write the file described by `index` to `dest`, fetching chunks from `store`.
///
/// Chunks are fetched with up to `threads` lookups in flight and written in
/// order. With `verify`, each chunk's hash is checked against its id.
pub async fn assemble(
    index: &Index,
    store: Arc<dyn Store>,
    dest: &Path,
    threads: usize,
    verify: bool,
) -> Result<(), ChunkerError> {
    let mut out = tokio::fs::File::create(dest).await?;

    let mut fetched = stream::iter(index.chunks.iter().cloned())
        .map(|chunk| {
            let store = store.clone();
            async move { fetch(store.as_ref(), chunk, verify).await }
        })
        .buffered(threads.max(1));

    let mut written = 0u64;
    while let Some(data) = fetched.try_next().await? {
        out.write_all(&data).await?;
        written = written.saturating_add(data.len() as u64);
    }
    out.flush().await?;
    out.sync_all().await?;

    if written != index.size {
        return Err(ChunkerError::Verify {
            id: String::new(),
            detail: format!("wrote {written} bytes, index says {}", index.size),
        });
    }

    info!(
        dest = %dest.display(),
        size = written,
        chunks = index.chunks.len(),
        "Assembled file"
    );
    Ok(())
}

/// Largest allocation made up front for one chunk; the store may still
/// return more, which then fails the size check.
const MAX_PREALLOC: u64 = v2020::MAXIMUM_MAX as u64;

/// Fetch one chunk and check its size, and its hash with `verify`.
pub(crate) async fn fetch(
    store: &dyn Store,
    chunk: IndexChunk,
    verify: bool,
) -> Result<Vec<u8>, ChunkerError> {
    let mut buf = Vec::with_capacity(chunk.size.min(MAX_PREALLOC) as usize);
    store.get_chunk(&chunk.key(), &mut buf).await?;

    if buf.len() as u64 != chunk.size {
        return Err(ChunkerError::Verify {
            id: chunk.id,
            detail: format!("got {} bytes, expected {}", buf.len(), chunk.size),
        });
    }
    if verify {
        let actual = chunk_id(&buf);
        if actual != chunk.id {
            return Err(ChunkerError::Verify {
                id: chunk.id,
                detail: format!("content hashes to {actual}"),
            });
        }
    }
    Ok(buf)
}
