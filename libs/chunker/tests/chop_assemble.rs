//! Chop a file into a chunk store and rebuild it.

use std::sync::Arc;

use casnap_chunker::{
    assemble, chop, load_index, store_index, ChunkSizePolicy, ChunkerError,
};
use casnap_store::{ChunkKey, LocalBackend, MemoryTier, RemoteTier, Store};

/// Deterministic, poorly compressible test data.
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn small_policy() -> ChunkSizePolicy {
    "4:16:64".parse().unwrap()
}

#[tokio::test]
async fn test_chop_then_assemble_reproduces_file() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("input.bin");
    let data = noise(1024 * 1024 + 17, 0x9e37_79b9_7f4a_7c15);
    std::fs::write(&src, &data).unwrap();

    let backend = Arc::new(LocalBackend::new(dir.path().join("store")));
    let chunks: Arc<dyn Store> = Arc::new(RemoteTier::chunks(backend.clone(), ""));
    let indexes = RemoteTier::indexes(backend, "");

    let index = chop(&src, small_policy(), chunks.clone(), 4).await.unwrap();
    assert_eq!(index.size, data.len() as u64);
    assert!(index.chunks.len() > 1);
    for chunk in &index.chunks {
        assert!(chunk.size <= 64 * 1024);
    }
    assert!(dir
        .path()
        .join("store/chunk")
        .join(format!("{}.cacnk", index.chunks[0].id))
        .is_file());

    store_index(&indexes, "image", &index).await.unwrap();
    assert!(dir.path().join("store/index/image.caibx").is_file());
    let loaded = load_index(&indexes, "image").await.unwrap();
    assert_eq!(loaded, index);

    let dest = dir.path().join("output.bin");
    assemble(&loaded, chunks, &dest, 4, true).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_chop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("input.bin");
    std::fs::write(&src, noise(200 * 1024, 42)).unwrap();

    let store: Arc<dyn Store> = Arc::new(MemoryTier::new(16 * 1024 * 1024));
    let first = chop(&src, small_policy(), store.clone(), 2).await.unwrap();
    let second = chop(&src, small_policy(), store, 2).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_assemble_detects_corrupt_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("input.bin");
    std::fs::write(&src, noise(100 * 1024, 7)).unwrap();

    let store = Arc::new(MemoryTier::new(16 * 1024 * 1024));
    let index = chop(&src, small_policy(), store.clone(), 2).await.unwrap();

    let victim = &index.chunks[0];
    let mut tampered = vec![0u8; victim.size as usize];
    tampered[0] = 1;
    store
        .put_chunk(&ChunkKey::chunk(&victim.id), &tampered)
        .await
        .unwrap();

    let dest = dir.path().join("out.bin");
    let err = assemble(&index, store.clone(), &dest, 2, true)
        .await
        .unwrap_err();
    assert!(matches!(err, ChunkerError::Verify { .. }));

    // Skipping verification trusts the store.
    assemble(&index, store, &dest, 2, false).await.unwrap();
}

#[tokio::test]
async fn test_assemble_reports_missing_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("input.bin");
    std::fs::write(&src, noise(50 * 1024, 3)).unwrap();

    let index = chop(&src, small_policy(), Arc::new(MemoryTier::new(1 << 24)), 1)
        .await
        .unwrap();

    let empty: Arc<dyn Store> = Arc::new(MemoryTier::new(1 << 24));
    let err = assemble(&index, empty, &dir.path().join("out"), 1, true)
        .await
        .unwrap_err();
    assert!(matches!(err, ChunkerError::Store(e) if e.is_not_found()));
}
