//! Seed images.
//!
//! A seed image is a one-layer image whose layer holds a single empty file
//! named after the source image's digest. Its layer diff id is what names
//! the chunk index of the converted image, so publishing the seed through a
//! registry (or a tarball) is how a converted image is found again.

use bytes::Bytes;
use tar::{Builder, EntryType, Header};
use tracing::info;

use crate::digest::Digest;
use crate::error::ImageError;
use crate::image::inspect;
use crate::manifest::{
    Descriptor, ImageConfig, Manifest, Platform, RootFs, OCI_CONFIG, OCI_LAYER_TAR, OCI_MANIFEST,
};
use crate::oci::OciClient;
use crate::reference::{parse_image_name, ImageSource};
use crate::tarball;

/// Repo tag written into seed tarballs.
pub const SEED_TARBALL_TAG: &str = "casnap-seed-tarball:v0";

/// A seed image, fully in memory.
#[derive(Debug, Clone)]
pub struct SeedImage {
    /// Uncompressed layer tar.
    pub layer: Bytes,
    /// Digest of the layer, which is also its diff id.
    pub diff_id: Digest,
    pub config: Bytes,
    pub manifest: Bytes,
}

/// Build the seed image for `content`.
pub fn build_seed(content: &str) -> Result<SeedImage, ImageError> {
    if content.is_empty() || content.contains('/') || content == "." || content == ".." {
        return Err(ImageError::Seed(format!(
            "{content:?} cannot be used as a file name"
        )));
    }

    let mut builder = Builder::new(Vec::new());
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, content, std::io::empty())?;
    let layer = Bytes::from(builder.into_inner()?);
    let diff_id = Digest::of(&layer);

    let platform = Platform::current();
    let config = ImageConfig {
        architecture: Some(platform.architecture),
        os: Some(platform.os),
        rootfs: RootFs {
            kind: "layers".to_string(),
            diff_ids: vec![diff_id.clone()],
        },
        extra: Default::default(),
    };
    let config = Bytes::from(serde_json::to_vec(&config)?);

    let manifest = Manifest {
        schema_version: 2,
        media_type: Some(OCI_MANIFEST.to_string()),
        config: Descriptor {
            media_type: OCI_CONFIG.to_string(),
            digest: Digest::of(&config),
            size: config.len() as u64,
        },
        layers: vec![Descriptor {
            media_type: OCI_LAYER_TAR.to_string(),
            digest: diff_id.clone(),
            size: layer.len() as u64,
        }],
    };
    let manifest = Bytes::from(serde_json::to_vec(&manifest)?);

    Ok(SeedImage {
        layer,
        diff_id,
        config,
        manifest,
    })
}

/// Publish the seed image for `content` to `name`, a registry reference or a
/// `tarball:` path that must not exist yet. Returns the layer diff id hex.
pub async fn push_seed(
    client: &OciClient,
    name: &str,
    content: &str,
) -> Result<String, ImageError> {
    let seed = build_seed(content)?;

    match parse_image_name(name)? {
        ImageSource::Registry(target) => {
            client
                .push_blob(&target, &seed.diff_id, seed.layer.clone())
                .await?;
            let config_digest = Digest::of(&seed.config);
            client
                .push_blob(&target, &config_digest, seed.config.clone())
                .await?;
            client
                .push_manifest(&target, OCI_MANIFEST, seed.manifest.clone())
                .await?;
        }
        ImageSource::Tarball(path) => {
            let (config, layer) = (seed.config.clone(), seed.layer.clone());
            tokio::task::spawn_blocking(move || {
                tarball::write(&path, SEED_TARBALL_TAG, &config, &[&layer[..]])
            })
            .await??;
        }
    }

    info!(image = %name, diff_id = %seed.diff_id, "Pushed seed image");
    Ok(seed.diff_id.hex().to_string())
}

/// Read the seed image at `name` and return its layer diff id hex.
pub async fn pull_seed(client: &OciClient, name: &str) -> Result<String, ImageError> {
    let (layers, diff_ids) = match parse_image_name(name)? {
        ImageSource::Registry(target) => {
            let remote = inspect(client, &target).await?;
            (remote.manifest.layers.len(), remote.config.rootfs.diff_ids)
        }
        ImageSource::Tarball(path) => {
            let config = tokio::task::spawn_blocking(move || tarball::read_config(&path)).await??;
            (config.rootfs.diff_ids.len(), config.rootfs.diff_ids)
        }
    };

    match diff_ids.as_slice() {
        [diff_id] if layers == 1 => {
            info!(image = %name, diff_id = %diff_id, "Pulled seed image");
            Ok(diff_id.hex().to_string())
        }
        _ => Err(ImageError::Seed(format!(
            "expected exactly 1 layer, got {layers} layers and {} diff ids",
            diff_ids.len()
        ))),
    }
}
