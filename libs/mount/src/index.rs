//! Index mount: a read-only FUSE filesystem exposing an indexed file.
//!
//! The target holds a single file, [`INDEX_FILENAME`]. Reads are served
//! straight from the chunk store: each read fetches only the chunks covering
//! the requested range, so nothing is downloaded up front.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use casnap_chunker::{Index, IndexReader};
use casnap_store::Store;
use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, Request,
};
use libc::{EINVAL, EIO, EISDIR, ENOENT, EROFS};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::MountError;
use crate::fsutil;
use crate::lifecycle::{self, MountHandle, MountOptions, Mounter};
use crate::sys;

/// Name of the file that appears inside the target.
pub const INDEX_FILENAME: &str = "squash";

const FUSE_DEVICE: &str = "/dev/fuse";
const ROOT_INO: u64 = 1;
const FILE_INO: u64 = 2;
/// Contents never change while mounted.
const TTL: Duration = Duration::from_secs(60);

/// The filesystem served to the kernel. Callbacks run on the FUSE session
/// thread and block on the runtime for chunk reads.
pub(crate) struct IndexFs {
    reader: Arc<IndexReader>,
    runtime: Handle,
    uid: u32,
    gid: u32,
    mtime: SystemTime,
}

impl IndexFs {
    pub(crate) fn new(reader: Arc<IndexReader>, runtime: Handle) -> Self {
        Self {
            reader,
            runtime,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            mtime: SystemTime::now(),
        }
    }

    fn attr(&self, ino: u64) -> Option<FileAttr> {
        let (kind, perm, nlink, size) = match ino {
            ROOT_INO => (FileType::Directory, 0o555, 2, 0),
            FILE_INO => (FileType::RegularFile, 0o444, 1, self.reader.size()),
            _ => return None,
        };
        Some(FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            crtime: self.mtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            flags: 0,
            blksize: 4096,
        })
    }

    fn lookup_entry(&self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        if parent != ROOT_INO || name != INDEX_FILENAME {
            return Err(ENOENT);
        }
        self.attr(FILE_INO).ok_or(ENOENT)
    }

    /// Entries after `offset`, each with the offset of the entry following it.
    fn dir_entries(
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, i64, FileType, &'static str)>, i32> {
        if ino != ROOT_INO {
            return Err(if ino == FILE_INO { EINVAL } else { ENOENT });
        }
        let all = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
            (FILE_INO, FileType::RegularFile, INDEX_FILENAME),
        ];
        let skip = usize::try_from(offset).map_err(|_| EINVAL)?;
        Ok(all
            .into_iter()
            .enumerate()
            .skip(skip)
            .map(|(i, (ino, kind, name))| (ino, i as i64 + 1, kind, name))
            .collect())
    }

    fn check_open(ino: u64, flags: i32) -> Result<(), i32> {
        match ino {
            FILE_INO if flags & libc::O_ACCMODE != libc::O_RDONLY => Err(EROFS),
            FILE_INO => Ok(()),
            ROOT_INO => Err(EISDIR),
            _ => Err(ENOENT),
        }
    }

    fn read_range(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        match ino {
            FILE_INO => {}
            ROOT_INO => return Err(EISDIR),
            _ => return Err(ENOENT),
        }
        let offset = u64::try_from(offset).map_err(|_| EINVAL)?;
        self.runtime
            .block_on(self.reader.read_at(offset, size as usize))
            .map_err(|e| {
                warn!(offset, size, error = %e, "Index read failed");
                EIO
            })
    }
}

impl Filesystem for IndexFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.attr(ino) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match Self::dir_entries(ino, offset) {
            Ok(entries) => {
                for (ino, next_offset, kind, name) in entries {
                    if reply.add(ino, next_offset, kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match Self::check_open(ino, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_range(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }
}

pub struct IndexMounter {
    reader: Arc<IndexReader>,
    target: PathBuf,
    session: Mutex<Option<BackgroundSession>>,
}

impl IndexMounter {
    pub fn new(
        index: Index,
        store: Arc<dyn Store>,
        target: impl Into<PathBuf>,
        verify: bool,
    ) -> Self {
        Self {
            reader: Arc::new(IndexReader::new(index, store, verify)),
            target: target.into(),
            session: Mutex::new(None),
        }
    }

    /// Path of the file once mounted.
    pub fn file_path(&self) -> PathBuf {
        self.target.join(INDEX_FILENAME)
    }

    fn take_session(&self) -> Option<BackgroundSession> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Mounter for IndexMounter {
    fn kind(&self) -> &'static str {
        "index"
    }

    fn target(&self) -> &Path {
        &self.target
    }

    /// Read the head of the file so an unreachable store or missing chunk
    /// fails the mount instead of the first read through it.
    async fn prepare(&self) -> Result<(), MountError> {
        self.reader.read_at(0, 1).await?;
        if !tokio::fs::try_exists(FUSE_DEVICE).await? {
            return Err(MountError::Precondition(format!(
                "{FUSE_DEVICE} is not available"
            )));
        }
        Ok(())
    }

    async fn mount(&self) -> Result<(), MountError> {
        let fs = IndexFs::new(self.reader.clone(), Handle::current());
        let target = self.target.clone();
        let session = tokio::task::spawn_blocking(move || {
            let options = [
                MountOption::RO,
                MountOption::FSName("casnap".to_string()),
            ];
            fuser::spawn_mount2(fs, &target, &options).map_err(|e| MountError::Failed {
                kind: "index",
                target: target.clone(),
                detail: format!("fuse mount: {e}"),
            })
        })
        .await??;
        debug!(target = %self.target.display(), "FUSE session started");
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        Ok(())
    }

    async fn release(&self) -> Result<(), MountError> {
        if let Some(session) = self.take_session() {
            // Dropping the session unmounts and stops its thread.
            tokio::task::spawn_blocking(move || drop(session)).await?;
        }
        // Still listing the file means the unmount above did not take.
        if fsutil::is_populated_dir(&self.target).await {
            sys::force_detach(&self.target)?;
        }
        Ok(())
    }
}

/// Mount `index` at `target`; the file appears as `target/squash`.
pub async fn mount_index(
    index: Index,
    store: Arc<dyn Store>,
    target: &Path,
    verify: bool,
    opts: MountOptions,
) -> Result<MountHandle, MountError> {
    let mounter = IndexMounter::new(index, store, target, verify);
    lifecycle::mount(Arc::new(mounter), opts).await
}
