//! Unpacking a layer into an overlay lower directory.
//!
//! OCI whiteouts become overlay whiteouts:
//! - `.wh.<name>` turns into a 0:0 character device named `<name>`
//! - `.wh..wh..opq` marks its directory with `trusted.overlay.opaque=y`

use std::ffi::{CStr, CString};
use std::fs;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::Uid;
use tar::Archive;
use tracing::{debug, warn};

use crate::error::ImageError;
use crate::image::Layer;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

const OPAQUE_XATTR: &CStr = c"trusted.overlay.opaque";

/// Unpack `layer` into `dest`, preserving permissions, mtimes and (as root)
/// ownership, and converting whiteouts. Blocking.
pub fn unpack_layer(layer: &Layer, dest: &Path) -> Result<(), ImageError> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(layer.uncompressed()?);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(Uid::effective().is_root());
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let entries = extract_archive(&mut archive, dest).map_err(|e| ImageError::Unpack {
        path: layer.path().to_path_buf(),
        detail: e.to_string(),
    })?;
    debug!(digest = %layer.digest(), dest = %dest.display(), entries, "Unpacked layer");
    Ok(())
}

fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping path with parent directory");
            continue;
        }
        let relative: PathBuf = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();

        let file_name = relative.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let parent = dest.join(relative.parent().unwrap_or(Path::new("")));
            fs::create_dir_all(&parent)?;
            if file_name == WHITEOUT_OPAQUE {
                set_opaque(&parent)?;
            } else {
                whiteout(&parent.join(target_name))?;
            }
            count += 1;
            continue;
        }

        if entry.unpack_in(dest)? {
            count += 1;
        }
    }
    Ok(count)
}

/// Replace whatever is at `path` with an overlay whiteout device.
fn whiteout(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    mknod(path, SFlag::S_IFCHR, Mode::empty(), makedev(0, 0))?;
    Ok(())
}

fn set_opaque(dir: &Path) -> io::Result<()> {
    let path = CString::new(dir.as_os_str().as_bytes())?;
    let value = b"y";
    // SAFETY: both strings are NUL-terminated and outlive the call.
    let rc = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            OPAQUE_XATTR.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
