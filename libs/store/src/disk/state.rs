//! In-memory bookkeeping for the disk tier: sizes, byte total, LRU order.
//!
//! Recency is a monotonically increasing access sequence number. The heap
//! holds `(seq, key)` records; a touch pushes a fresh record and leaves the
//! old one behind, so `pop_lru` skips records whose sequence no longer
//! matches the live entry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::SystemTime;

use crate::key::ChunkKey;

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DiskState {
    entries: HashMap<ChunkKey, Entry>,
    heap: BinaryHeap<Reverse<(u64, ChunkKey)>>,
    next_seq: u64,
    total_bytes: u64,
}

/// One file found while scanning the cache root.
#[derive(Debug, Clone)]
pub(crate) struct ScannedFile {
    pub key: ChunkKey,
    pub size: u64,
    pub accessed: SystemTime,
}

impl DiskState {
    /// Build state from a directory scan, oldest access first.
    pub(crate) fn from_scan(mut files: Vec<ScannedFile>) -> Self {
        files.sort_by(|a, b| a.accessed.cmp(&b.accessed));
        let mut state = Self::default();
        for file in files {
            state.insert(file.key, file.size);
        }
        state
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Record a new file as most recently used. Returns false if the key was
    /// already tracked, in which case nothing changes.
    pub(crate) fn insert(&mut self, key: ChunkKey, size: u64) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        let seq = self.bump();
        self.entries.insert(key.clone(), Entry { size, seq });
        self.heap.push(Reverse((seq, key)));
        self.total_bytes += size;
        true
    }

    /// Mark a tracked key as most recently used.
    pub(crate) fn touch(&mut self, key: &ChunkKey) -> bool {
        let seq = self.bump();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.seq = seq;
                self.heap.push(Reverse((seq, key.clone())));
                self.maybe_compact();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, key: &ChunkKey) -> Option<u64> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size;
        Some(entry.size)
    }

    /// Remove and return the least recently used key and its size.
    pub(crate) fn pop_lru(&mut self) -> Option<(ChunkKey, u64)> {
        while let Some(Reverse((seq, key))) = self.heap.pop() {
            let live = matches!(self.entries.get(&key), Some(entry) if entry.seq == seq);
            if live {
                let size = self.remove(&key)?;
                return Some((key, size));
            }
        }
        None
    }

    /// Bring state in line with what is actually on disk.
    ///
    /// Entries whose files vanished are dropped; files not yet tracked are
    /// adopted as the oldest entries. Returns `(adopted, dropped)`.
    pub(crate) fn reconcile(&mut self, mut scanned: Vec<ScannedFile>) -> (usize, usize) {
        let present: std::collections::HashSet<&ChunkKey> =
            scanned.iter().map(|f| &f.key).collect();
        let gone: Vec<ChunkKey> = self
            .entries
            .keys()
            .filter(|k| !present.contains(k))
            .cloned()
            .collect();
        drop(present);

        for key in &gone {
            self.remove(key);
        }

        scanned.retain(|f| !self.entries.contains_key(&f.key));
        scanned.sort_by(|a, b| a.accessed.cmp(&b.accessed));
        let adopted = scanned.len();

        // Adopted files go to the cold end of the order: rebuild with them
        // first, then replay live entries in their current order.
        let mut live: Vec<(u64, ChunkKey, u64)> = self
            .entries
            .drain()
            .map(|(key, entry)| (entry.seq, key, entry.size))
            .collect();
        live.sort_by_key(|(seq, _, _)| *seq);

        self.heap.clear();
        self.total_bytes = 0;
        for file in scanned {
            self.insert(file.key, file.size);
        }
        for (_, key, size) in live {
            self.insert(key, size);
        }

        (adopted, gone.len())
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Rebuild the heap when stale records dominate it.
    fn maybe_compact(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.entries.len() * 4 {
            self.heap = self
                .entries
                .iter()
                .map(|(key, entry)| Reverse((entry.seq, key.clone())))
                .collect();
        }
    }
}
