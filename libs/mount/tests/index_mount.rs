//! Index mounts serve a chunked file over FUSE.

use std::sync::Arc;
use std::time::Duration;

use casnap_chunker::{chop, ChunkSizePolicy};
use casnap_mount::{mount_index, MountError, MountOptions, INDEX_FILENAME};
use casnap_store::{MemoryTier, Store};

fn opts() -> MountOptions {
    MountOptions {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_secs(10),
    }
}

fn payload() -> Vec<u8> {
    (0..300_000u32).flat_map(|i| (i.wrapping_mul(2_654_435_761)).to_le_bytes()).collect()
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires /dev/fuse and fusermount"]
async fn test_index_mount_serves_file() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("image.sqfs");
    let data = payload();
    std::fs::write(&src, &data).unwrap();

    let store: Arc<dyn Store> = Arc::new(MemoryTier::new(64 * 1024 * 1024));
    let policy: ChunkSizePolicy = "4:16:64".parse().unwrap();
    let index = chop(&src, policy, store.clone(), 4).await.unwrap();

    let target = dir.path().join("idx");
    let handle = mount_index(index, store, &target, true, opts())
        .await
        .unwrap();

    let file = target.join(INDEX_FILENAME);
    let read = tokio::task::spawn_blocking({
        let file = file.clone();
        move || std::fs::read(file).unwrap()
    })
    .await
    .unwrap();
    assert_eq!(read, data);
    assert!(std::fs::OpenOptions::new().write(true).open(&file).is_err());

    handle.unmount().await.unwrap();
    assert!(!file.exists());
}

#[tokio::test]
async fn test_index_mount_with_missing_chunks_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("image.sqfs");
    std::fs::write(&src, payload()).unwrap();

    let policy: ChunkSizePolicy = "4:16:64".parse().unwrap();
    let index = chop(&src, policy, Arc::new(MemoryTier::new(1 << 26)), 2)
        .await
        .unwrap();

    let target = dir.path().join("idx");
    let empty: Arc<dyn Store> = Arc::new(MemoryTier::new(1 << 20));
    let err = mount_index(index, empty, &target, true, opts())
        .await
        .unwrap_err();

    assert!(matches!(err, MountError::Chunker(_)), "{err}");
    assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
}
