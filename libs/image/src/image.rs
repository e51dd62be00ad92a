//! Pulled images and their layers.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::info;

use crate::digest::Digest;
use crate::error::ImageError;
use crate::manifest::{ImageConfig, Manifest};
use crate::oci::OciClient;
use crate::reference::{parse_image_name, ImageSource, RegistryRef};
use crate::tarball;

/// A layer blob on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    digest: Digest,
    path: PathBuf,
}

impl Layer {
    pub fn new(digest: Digest, path: impl Into<PathBuf>) -> Self {
        Self {
            digest,
            path: path.into(),
        }
    }

    /// Digest of the blob as stored (compressed, if it is).
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the blob is gzip compressed.
    pub fn is_gzip(&self) -> io::Result<bool> {
        is_gzip(&self.path)
    }

    /// A reader over the uncompressed tar stream.
    pub fn uncompressed(&self) -> io::Result<Box<dyn Read + Send>> {
        let gzip = self.is_gzip()?;
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(if gzip {
            Box::new(GzDecoder::new(reader))
        } else {
            Box::new(reader)
        })
    }
}

/// An image whose layers are all available locally, base layer first.
#[derive(Debug, Clone)]
pub struct Image {
    /// Manifest digest for registry images, config digest for tarballs.
    pub digest: Digest,
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
}

impl Image {
    pub fn new(
        digest: Digest,
        config: ImageConfig,
        layers: Vec<Layer>,
    ) -> Result<Self, ImageError> {
        if config.rootfs.diff_ids.len() != layers.len() {
            return Err(ImageError::DiffIdCount {
                layers: layers.len(),
                diff_ids: config.rootfs.diff_ids.len(),
            });
        }
        Ok(Self {
            digest,
            config,
            layers,
        })
    }

    /// Digests of the uncompressed layers, base layer first.
    pub fn diff_ids(&self) -> &[Digest] {
        &self.config.rootfs.diff_ids
    }
}

/// Pull an image by name (see [`crate::reference`] for the grammar).
pub async fn pull(client: &OciClient, name: &str) -> Result<Image, ImageError> {
    match parse_image_name(name)? {
        ImageSource::Registry(target) => pull_from_registry(client, &target).await,
        ImageSource::Tarball(path) => {
            let blob_dir = client.config().blob_dir.clone();
            tokio::task::spawn_blocking(move || tarball::load(&path, &blob_dir)).await?
        }
    }
}

/// Pull manifest, config and every layer blob of a registry image.
pub async fn pull_from_registry(
    client: &OciClient,
    target: &RegistryRef,
) -> Result<Image, ImageError> {
    let remote = inspect(client, target).await?;

    let mut layers = Vec::with_capacity(remote.manifest.layers.len());
    for descriptor in &remote.manifest.layers {
        let path = client.pull_blob(target, &descriptor.digest).await?;
        layers.push(Layer::new(descriptor.digest.clone(), path));
    }

    info!(
        image = %target,
        digest = %remote.digest,
        layers = layers.len(),
        size = remote.manifest.total_layer_size(),
        "Pulled image"
    );
    Image::new(remote.digest, remote.config, layers)
}

/// An image's metadata as held by a registry.
#[derive(Debug, Clone)]
pub struct RemoteImage {
    pub digest: Digest,
    pub manifest: Manifest,
    pub config: ImageConfig,
}

/// Fetch manifest and config without downloading layers.
pub async fn inspect(client: &OciClient, target: &RegistryRef) -> Result<RemoteImage, ImageError> {
    let (digest, manifest) = client.pull_manifest(target).await?;
    let raw = client.fetch_blob(target, &manifest.config.digest).await?;
    let config: ImageConfig = serde_json::from_slice(&raw)?;
    Ok(RemoteImage {
        digest,
        manifest,
        config,
    })
}

/// Check if a file is gzip compressed.
pub(crate) fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    #[test]
    fn test_uncompressed_reads_both_forms() {
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"hello layer").unwrap();

        let gz = dir.path().join("gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        encoder.write_all(b"hello layer").unwrap();
        encoder.finish().unwrap();

        for (path, gzip) in [(plain, false), (gz, true)] {
            let layer = Layer::new(Digest::of(b"x"), &path);
            assert_eq!(layer.is_gzip().unwrap(), gzip);
            let mut out = String::new();
            layer.uncompressed().unwrap().read_to_string(&mut out).unwrap();
            assert_eq!(out, "hello layer");
        }
    }

    #[test]
    fn test_is_gzip_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one");
        std::fs::write(&path, [0x1f]).unwrap();
        assert!(!is_gzip(&path).unwrap());
    }

    #[test]
    fn test_image_requires_matching_diff_ids() {
        let config = ImageConfig::default();
        let layers = vec![Layer::new(Digest::of(b"a"), "/a")];
        assert!(matches!(
            Image::new(Digest::of(b"m"), config, layers),
            Err(ImageError::DiffIdCount {
                layers: 1,
                diff_ids: 0
            })
        ));
    }
}
