//! Overlay of decompressed image layers.
//!
//! Scratch layout:
//!
//! ```text
//! <scratch>/lower/<digest hex[..16]>   one unpacked layer each
//! <scratch>/upper
//! <scratch>/work
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use casnap_image::{unpack_layer, Layer};
use tracing::{debug, info};

use crate::error::MountError;
use crate::fsutil;
use crate::lifecycle::Mounter;
use crate::sys;

pub struct OverlayMounter {
    /// Bottom layer first, as listed in the image manifest.
    layers: Vec<Layer>,
    scratch: PathBuf,
    target: PathBuf,
    index_off: bool,
}

impl OverlayMounter {
    pub fn new(
        layers: Vec<Layer>,
        scratch: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            layers,
            scratch: scratch.into(),
            target: target.into(),
            index_off: sys::overlay_supports_index_off(),
        }
    }

    fn lower_root(&self) -> PathBuf {
        self.scratch.join("lower")
    }

    fn upper(&self) -> PathBuf {
        self.scratch.join("upper")
    }

    fn work(&self) -> PathBuf {
        self.scratch.join("work")
    }

    fn lower_dir(&self, layer: &Layer) -> PathBuf {
        let hex = layer.digest().hex();
        self.lower_root().join(&hex[..hex.len().min(16)])
    }

    /// Lower directories, topmost first.
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        self.layers.iter().rev().map(|l| self.lower_dir(l)).collect()
    }

    /// The `-o` option string passed to the kernel.
    pub fn options(&self) -> String {
        let lower: Vec<String> = self
            .lower_dirs()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let mut opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.join(":"),
            self.upper().display(),
            self.work().display()
        );
        if self.index_off {
            opts.push_str(",index=off");
        }
        opts
    }

    /// Unpack `layer` once. The staging directory is renamed into place only
    /// when complete, so an existing lower dir is always a full layer.
    async fn unpack_once(&self, layer: &Layer) -> Result<(), MountError> {
        let dir = self.lower_dir(layer);
        if tokio::fs::try_exists(&dir).await? {
            debug!(digest = %layer.digest(), dir = %dir.display(), "Layer already unpacked");
            return Ok(());
        }

        let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let staging = self.lower_root().join(format!(".{name}.partial"));
        fsutil::remove_dir_all(&staging).await?;
        tokio::fs::create_dir_all(&staging).await?;

        let unpack = {
            let layer = layer.clone();
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || unpack_layer(&layer, &staging)).await?
        };
        if let Err(e) = unpack {
            let _ = fsutil::remove_dir_all(&staging).await;
            return Err(e.into());
        }

        tokio::fs::rename(&staging, &dir).await?;
        info!(digest = %layer.digest(), dir = %dir.display(), "Unpacked layer");
        Ok(())
    }
}

#[async_trait]
impl Mounter for OverlayMounter {
    fn kind(&self) -> &'static str {
        "overlay"
    }

    fn target(&self) -> &Path {
        &self.target
    }

    async fn prepare(&self) -> Result<(), MountError> {
        if self.layers.is_empty() {
            return Err(MountError::Precondition(
                "overlay needs at least one layer".to_string(),
            ));
        }
        tokio::fs::create_dir_all(self.lower_root()).await?;
        for dir in [self.upper(), self.work()] {
            tokio::fs::create_dir_all(&dir).await?;
            if !fsutil::is_empty_dir(&dir).await {
                return Err(MountError::Precondition(format!(
                    "{} is not empty",
                    dir.display()
                )));
            }
        }
        for layer in &self.layers {
            self.unpack_once(layer).await?;
        }
        Ok(())
    }

    async fn mount(&self) -> Result<(), MountError> {
        let target = self.target.clone();
        let opts = self.options();
        tokio::task::spawn_blocking(move || {
            sys::mount_fs(
                "overlay",
                Path::new("overlay"),
                &target,
                "overlay",
                false,
                Some(&opts),
            )
        })
        .await?
    }

    async fn release(&self) -> Result<(), MountError> {
        sys::force_detach(&self.target)?;
        fsutil::remove_dir_all(&self.scratch)
            .await
            .map_err(|e| MountError::Cleanup {
                target: self.scratch.clone(),
                detail: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casnap_image::Digest;

    fn layer(hex_char: char) -> Layer {
        let hex: String = std::iter::repeat(hex_char).take(64).collect();
        Layer::new(
            Digest::parse(&format!("sha256:{hex}")).unwrap(),
            PathBuf::from("/nonexistent"),
        )
    }

    #[test]
    fn test_lower_dirs_are_top_first_and_truncated() {
        let mut mounter = OverlayMounter::new(
            vec![layer('a'), layer('b')],
            "/scratch",
            "/mnt/rootfs",
        );
        mounter.index_off = false;

        assert_eq!(
            mounter.lower_dirs(),
            vec![
                PathBuf::from("/scratch/lower/bbbbbbbbbbbbbbbb"),
                PathBuf::from("/scratch/lower/aaaaaaaaaaaaaaaa"),
            ]
        );
        assert_eq!(
            mounter.options(),
            "lowerdir=/scratch/lower/bbbbbbbbbbbbbbbb:/scratch/lower/aaaaaaaaaaaaaaaa,\
             upperdir=/scratch/upper,workdir=/scratch/work"
        );

        mounter.index_off = true;
        assert!(mounter.options().ends_with(",index=off"));
    }

    #[tokio::test]
    async fn test_prepare_rejects_empty_layer_list() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = OverlayMounter::new(vec![], dir.path().join("s"), dir.path().join("t"));
        assert!(matches!(
            mounter.prepare().await,
            Err(MountError::Precondition(_))
        ));
    }
}
