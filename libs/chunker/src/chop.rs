//! Split a file into chunks and upload them.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use casnap_store::{ChunkKey, Store};
use fastcdc::v2020::StreamCDC;
use futures_util::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::error::ChunkerError;
use crate::index::{chunk_id, Index, IndexChunk};
use crate::policy::ChunkSizePolicy;

/// Chunks buffered between the chunking thread and the uploaders.
const PIPELINE_DEPTH: usize = 16;

struct Cut {
    offset: u64,
    data: Vec<u8>,
}

/// Chunk `path` with `policy`, uploading every chunk into `store`.
///
/// Up to `threads` uploads run concurrently. Uploading an existing chunk is
/// harmless, so running this twice over the same file is safe. Returns the
/// index describing the file; storing it is left to the caller.
pub async fn chop(
    path: &Path,
    policy: ChunkSizePolicy,
    store: Arc<dyn Store>,
    threads: usize,
) -> Result<Index, ChunkerError> {
    let file = File::open(path)?;
    let (tx, rx) = mpsc::channel::<Result<Cut, ChunkerError>>(PIPELINE_DEPTH);

    let producer = tokio::task::spawn_blocking(move || {
        let chunker = StreamCDC::new(file, policy.min, policy.avg, policy.max);
        for result in chunker {
            let item = result
                .map(|c| Cut {
                    offset: c.offset,
                    data: c.data,
                })
                .map_err(|e| ChunkerError::Cdc(e.to_string()));
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });

    let chunks: Vec<IndexChunk> = ReceiverStream::new(rx)
        .map(|item| {
            let store = store.clone();
            async move {
                let cut = item?;
                let id = chunk_id(&cut.data);
                store.put_chunk(&ChunkKey::chunk(&id), &cut.data).await?;
                debug!(id = %id, offset = cut.offset, size = cut.data.len(), "Uploaded chunk");
                Ok::<_, ChunkerError>(IndexChunk {
                    id,
                    offset: cut.offset,
                    size: cut.data.len() as u64,
                })
            }
        })
        .buffered(threads.max(1))
        .try_collect()
        .await?;

    producer.await?;

    let mut index = Index::new(policy);
    index.size = chunks.iter().map(|c| c.size).sum();
    index.chunks = chunks;

    info!(
        path = %path.display(),
        size = index.size,
        chunks = index.chunks.len(),
        "Chopped file"
    );
    Ok(index)
}
