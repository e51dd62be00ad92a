//! Mounts for casnap.
//!
//! All mount kinds share one lifecycle ([`lifecycle::mount`]): dispatch the
//! kernel operation in the background, poll the target until it is populated,
//! bound the wait with a timeout, and release everything on failure.
//!
//! Kinds:
//! - [`OverlayMounter`]: image layers unpacked into lower dirs, overlay on top
//! - [`IndexMounter`]: a chunk index served read-only over FUSE as one file
//! - [`SquashfsMounter`]: a loop device mounted read-only as squashfs

pub mod error;
pub mod exec;
pub mod fsutil;
pub mod index;
pub mod lifecycle;
pub mod loopdev;
pub mod overlay;
pub mod squashfs;
mod sys;
pub mod tools;

pub use error::{ExecError, LoopError, MountError};
pub use index::{mount_index, IndexMounter, INDEX_FILENAME};
pub use lifecycle::{mount, MountHandle, MountOptions, Mounter};
pub use loopdev::{LoopDevice, Losetup};
pub use overlay::OverlayMounter;
pub use squashfs::{make_squashfs, mount_squashfs_file, SquashfsMounter, MKSQUASHFS_OPTS};
pub use sys::{force_detach, overlay_supports_index_off};
pub use tools::Tools;
