//! On-disk chunk tier with a byte budget and LRU eviction.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/
//! ├── .flock          advisory lock shared by every process using the root
//! ├── .tmp/           staging area; files are renamed into place when complete
//! └── <escaped key>   one file per chunk
//! ```
//!
//! Keys are escaped so each key maps to exactly one file name and the name can
//! be mapped back to the key when the root is rescanned.

mod lock;
mod state;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::key::ChunkKey;
use crate::store::{Capabilities, Store};

use lock::FileLock;
use state::{DiskState, ScannedFile};

const TMP_DIR: &str = ".tmp";
const LOCK_FILE: &str = ".flock";

/// Staging files older than this are considered abandoned.
const STALE_STAGING_AGE: Duration = Duration::from_secs(10 * 60);

/// Configuration for the disk tier.
#[derive(Debug, Clone)]
pub struct DiskTierConfig {
    /// Cache root directory.
    pub root: PathBuf,
    /// Byte budget for chunk files.
    pub max_bytes: u64,
    /// Interval between background reconcile passes.
    pub clean_interval: Duration,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/casnap/diskcache"),
            max_bytes: 1024 * 1024 * 1024, // 1 GiB
            clean_interval: Duration::from_secs(300),
        }
    }
}

/// Counters for the disk tier.
#[derive(Debug, Default)]
pub struct DiskStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Files found on disk that were not tracked.
    pub adopted: usize,
    /// Tracked entries whose files had disappeared.
    pub dropped: usize,
    /// Entries evicted to get back under budget.
    pub evicted: usize,
    /// Abandoned staging files removed.
    pub swept: usize,
    pub total_bytes: u64,
}

/// Disk-backed tier. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DiskTier {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    tmp: PathBuf,
    lock_path: PathBuf,
    max_bytes: u64,
    clean_interval: Duration,
    state: RwLock<DiskState>,
    staging_seq: AtomicU64,
    stats: DiskStats,
}

impl DiskTier {
    /// Open (or create) a cache root and warm the tier from its contents.
    pub async fn open(config: DiskTierConfig) -> Result<Self, StoreError> {
        let root = config.root;
        let tmp = root.join(TMP_DIR);
        tokio::fs::create_dir_all(&tmp).await?;

        let lock_path = root.join(LOCK_FILE);
        let scanned = {
            let _flock = FileLock::exclusive(lock_path.clone()).await?;
            sweep_staging(tmp.clone()).await?;
            scan_root(root.clone()).await?
        };
        let state = DiskState::from_scan(scanned);

        info!(
            root = %root.display(),
            entries = state.len(),
            total_bytes = state.total_bytes(),
            max_bytes = config.max_bytes,
            "Opened disk tier"
        );

        let tier = Self {
            inner: Arc::new(Inner {
                root,
                tmp,
                lock_path,
                max_bytes: config.max_bytes,
                clean_interval: config.clean_interval,
                state: RwLock::new(state),
                staging_seq: AtomicU64::new(0),
                stats: DiskStats::default(),
            }),
        };

        {
            let mut state = tier.inner.state.write().await;
            let _flock = FileLock::exclusive(tier.inner.lock_path.clone()).await?;
            tier.evict_to_budget(&mut state).await;
        }

        Ok(tier)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    pub fn stats(&self) -> &DiskStats {
        &self.inner.stats
    }

    /// Bytes currently accounted to cached files.
    pub async fn total_bytes(&self) -> u64 {
        self.inner.state.read().await.total_bytes()
    }

    /// Number of cached files.
    pub async fn len(&self) -> usize {
        self.inner.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &ChunkKey) -> bool {
        self.inner.state.read().await.contains(key)
    }

    /// Rescan the root and bring the in-memory state back in line with it.
    ///
    /// Runs under the same write lock and exclusive file lock as the insert
    /// path, so it never interleaves with an eviction from `put_chunk`.
    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let mut state = self.inner.state.write().await;
        let _flock = FileLock::exclusive(self.inner.lock_path.clone()).await?;

        let swept = sweep_staging(self.inner.tmp.clone()).await?;
        let scanned = scan_root(self.inner.root.clone()).await?;
        let (adopted, dropped) = state.reconcile(scanned);
        let evicted = self.evict_to_budget(&mut state).await;

        Ok(ReconcileReport {
            adopted,
            dropped,
            evicted,
            swept,
            total_bytes: state.total_bytes(),
        })
    }

    /// Run `reconcile` every `clean_interval` until shutdown is signalled.
    pub async fn run_gc_loop(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            root = %self.inner.root.display(),
            interval_secs = self.inner.clean_interval.as_secs(),
            "Starting disk tier GC loop"
        );

        let mut interval_timer = tokio::time::interval(self.inner.clean_interval);
        // The first tick fires immediately; open() already left the tier
        // within budget.
        interval_timer.tick().await;

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    match self.reconcile().await {
                        Ok(report) => debug!(
                            adopted = report.adopted,
                            dropped = report.dropped,
                            evicted = report.evicted,
                            swept = report.swept,
                            total_bytes = report.total_bytes,
                            "Disk tier reconciled"
                        ),
                        Err(e) => warn!(error = %e, "Disk tier reconcile failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Disk tier GC loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn path_for(&self, key: &ChunkKey) -> Result<PathBuf, StoreError> {
        if key.as_str().is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        Ok(self.inner.root.join(escape_key(key.as_str())))
    }

    fn staging_path(&self) -> PathBuf {
        let seq = self.inner.staging_seq.fetch_add(1, Ordering::Relaxed);
        self.inner
            .tmp
            .join(format!("{}.{}", std::process::id(), seq))
    }

    /// Evict least recently used files until the total fits the budget.
    /// Caller holds the state write lock and the exclusive file lock.
    async fn evict_to_budget(&self, state: &mut DiskState) -> usize {
        let mut evicted = 0;
        while state.total_bytes() > self.inner.max_bytes {
            let Some((key, size)) = state.pop_lru() else {
                break;
            };
            let path = self.inner.root.join(escape_key(key.as_str()));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to remove evicted chunk"),
            }
            debug!(key = %key, size, "Evicted chunk");
            evicted += 1;
        }
        if evicted > 0 {
            self.inner
                .stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }
}

#[async_trait]
impl Store for DiskTier {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_WRITE
    }

    async fn get_chunk(&self, key: &ChunkKey, buf: &mut Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;

        let read = {
            let _state = self.inner.state.read().await;
            let _flock = FileLock::shared(self.inner.lock_path.clone()).await?;
            read_into(&path, buf).await
        };

        match read {
            Ok(size) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                let mut state = self.inner.state.write().await;
                if !state.touch(key) {
                    // Written by another process sharing the root; adopting
                    // it counts against the budget like a put.
                    let _flock = FileLock::exclusive(self.inner.lock_path.clone()).await?;
                    state.insert(key.clone(), size);
                    self.evict_to_budget(&mut state).await;
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                let mut state = self.inner.state.write().await;
                if state.contains(key) && !tokio::fs::try_exists(&path).await.unwrap_or(true) {
                    state.remove(key);
                }
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put_chunk(&self, key: &ChunkKey, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;

        if self.inner.state.read().await.contains(key) {
            return Ok(());
        }
        let size = data.len() as u64;
        if size > self.inner.max_bytes {
            return Err(StoreError::TooLarge {
                key: key.to_string(),
                size,
                max: self.inner.max_bytes,
            });
        }

        let staging = self.staging_path();
        if let Err(e) = write_staging(&staging, data).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        let mut state = self.inner.state.write().await;
        let _flock = FileLock::exclusive(self.inner.lock_path.clone()).await?;

        if state.contains(key) {
            let _ = tokio::fs::remove_file(&staging).await;
            return Ok(());
        }

        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        state.insert(key.clone(), size);
        self.evict_to_budget(&mut state).await;
        Ok(())
    }
}

async fn read_into(path: &Path, buf: &mut Vec<u8>) -> io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    buf.clear();
    let size = file.read_to_end(buf).await?;
    Ok(size as u64)
}

async fn write_staging(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_data().await?;
    Ok(())
}

/// List cached files under the root. Dot files are reserved and skipped.
async fn scan_root(root: PathBuf) -> io::Result<Vec<ScannedFile>> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(key) = unescape_key(name) else {
                warn!(name, "Skipping unrecognized file in disk tier root");
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let accessed = metadata
                .accessed()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(ScannedFile {
                key: ChunkKey::new(key),
                size: metadata.len(),
                accessed,
            });
        }
        Ok(files)
    })
    .await
    .map_err(io::Error::other)?
}

/// Remove abandoned staging files. Returns how many were removed.
async fn sweep_staging(tmp: PathBuf) -> io::Result<usize> {
    tokio::task::spawn_blocking(move || {
        let now = SystemTime::now();
        let mut swept = 0;
        for entry in std::fs::read_dir(&tmp)? {
            let entry = entry?;
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if metadata.is_file() && age >= STALE_STAGING_AGE {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => swept += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(swept)
    })
    .await
    .map_err(io::Error::other)?
}

/// Map a key to a single path component.
///
/// `/` and `%` are percent-escaped, as is a leading `.` so that no key can
/// collide with the reserved dot files.
pub(crate) fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, ch) in key.chars().enumerate() {
        match ch {
            '/' => out.push_str("%2F"),
            '%' => out.push_str("%25"),
            '.' if i == 0 => out.push_str("%2E"),
            _ => out.push(ch),
        }
    }
    out
}

/// Inverse of `escape_key`. Returns `None` for names it could not produce.
pub(crate) fn unescape_key(name: &str) -> Option<String> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3)?;
        match code {
            "2F" => out.push('/'),
            "25" => out.push('%'),
            "2E" if out.is_empty() => out.push('.'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    if out.is_empty() || escape_key(&out) != name {
        return None;
    }
    Some(out)
}
