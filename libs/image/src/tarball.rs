//! `docker save` archives.
//!
//! Layout: `manifest.json` lists one image as
//! `[{"Config": "<file>", "RepoTags": [...], "Layers": ["<file>", ...]}]`;
//! the config and layer files sit alongside it in the same tar.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info};

use crate::digest::Digest;
use crate::error::ImageError;
use crate::image::{Image, Layer};
use crate::manifest::ImageConfig;
use crate::oci::blob_path;

pub const MANIFEST_FILE: &str = "manifest.json";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TarballManifest {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// Load an image from a `docker save` archive, copying its config and layers
/// into `blob_dir`.
pub fn load(path: &Path, blob_dir: &Path) -> Result<Image, ImageError> {
    let manifest = read_manifest(path)?;
    debug!(
        path = %path.display(),
        tags = ?manifest.repo_tags,
        layers = manifest.layers.len(),
        "Read tarball manifest"
    );

    let mut wanted: HashMap<String, Option<(Digest, PathBuf)>> = HashMap::new();
    wanted.insert(normalize(&manifest.config), None);
    for layer in &manifest.layers {
        wanted.insert(normalize(layer), None);
    }

    let mut archive = Archive::new(BufReader::new(File::open(path)?));
    for entry in archive.entries()? {
        let entry = entry?;
        if !matches!(entry.header().entry_type(), EntryType::Regular | EntryType::Continuous) {
            continue;
        }
        let name = normalize(&entry.path()?.to_string_lossy());
        if let Some(slot) = wanted.get_mut(&name) {
            if slot.is_none() {
                *slot = Some(copy_to_blob(entry, blob_dir)?);
            }
        }
    }

    let resolve = |name: &str| -> Result<(Digest, PathBuf), ImageError> {
        wanted
            .get(&normalize(name))
            .cloned()
            .flatten()
            .ok_or_else(|| ImageError::tarball(path, format!("missing entry {name:?}")))
    };

    let (config_digest, config_path) = resolve(&manifest.config)?;
    let config: ImageConfig = serde_json::from_slice(&fs::read(&config_path)?)?;
    let layers = manifest
        .layers
        .iter()
        .map(|name| resolve(name).map(|(digest, path)| Layer::new(digest, path)))
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        path = %path.display(),
        digest = %config_digest,
        layers = layers.len(),
        "Loaded image from tarball"
    );
    Image::new(config_digest, config, layers)
}

/// Read the config of the single image in a `docker save` archive without
/// copying any layers.
pub fn read_config(path: &Path) -> Result<ImageConfig, ImageError> {
    let manifest = read_manifest(path)?;
    let config_name = normalize(&manifest.config);
    let mut archive = Archive::new(BufReader::new(File::open(path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if normalize(&entry.path()?.to_string_lossy()) == config_name {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw)?;
            return Ok(serde_json::from_slice(&raw)?);
        }
    }
    Err(ImageError::tarball(
        path,
        format!("missing entry {:?}", manifest.config),
    ))
}

fn read_manifest(path: &Path) -> Result<TarballManifest, ImageError> {
    let mut archive = Archive::new(BufReader::new(File::open(path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if normalize(&entry.path()?.to_string_lossy()) != MANIFEST_FILE {
            continue;
        }
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        let mut images: Vec<TarballManifest> = serde_json::from_slice(&raw)?;
        if images.len() != 1 {
            return Err(ImageError::tarball(
                path,
                format!("{MANIFEST_FILE} lists {} images, want exactly 1", images.len()),
            ));
        }
        return Ok(images.remove(0));
    }
    Err(ImageError::tarball(path, format!("no {MANIFEST_FILE}")))
}

/// Write a single-image `docker save` archive. Fails if `path` exists.
pub fn write(
    path: &Path,
    repo_tag: &str,
    config: &[u8],
    layers: &[&[u8]],
) -> Result<(), ImageError> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;

    let result = (|| -> Result<(), ImageError> {
        let mut builder = Builder::new(file);
        let config_name = format!("{}.json", Digest::of(config).hex());
        append(&mut builder, &config_name, config)?;

        let mut layer_names = Vec::with_capacity(layers.len());
        for layer in layers {
            let name = format!("{}/layer.tar", Digest::of(layer).hex());
            append(&mut builder, &name, layer)?;
            layer_names.push(name);
        }

        let manifest = vec![TarballManifest {
            config: config_name,
            repo_tags: Some(vec![repo_tag.to_string()]),
            layers: layer_names,
        }];
        append(&mut builder, MANIFEST_FILE, &serde_json::to_vec(&manifest)?)?;

        let mut file = builder.into_inner()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(path);
    }
    result
}

fn append<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> io::Result<()> {
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, name, data)
}

/// Stream `reader` into the blob directory under its sha256.
fn copy_to_blob<R: Read>(mut reader: R, blob_dir: &Path) -> Result<(Digest, PathBuf), ImageError> {
    let dir = blob_dir.join("sha256");
    fs::create_dir_all(&dir)?;
    let staging = dir.join(format!(
        ".tarball.{}.{}.partial",
        std::process::id(),
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| -> Result<(Digest, PathBuf), ImageError> {
        let mut file = File::create(&staging)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])?;
        }
        file.sync_all()?;
        drop(file);

        let digest = Digest::from_hasher(hasher);
        let dest = blob_path(blob_dir, &digest);
        fs::rename(&staging, &dest)?;
        Ok((digest, dest))
    })();

    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

/// Entry names compare without a leading `./`.
fn normalize(name: &str) -> String {
    Path::new(name)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(layers: &[&[u8]]) -> Vec<u8> {
        let mut config = ImageConfig::default();
        config.rootfs.diff_ids = layers.iter().map(|l| Digest::of(l)).collect();
        serde_json::to_vec(&config).unwrap()
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("image.tar");
        let blobs = dir.path().join("blobs");
        let layers: [&[u8]; 2] = [b"base layer", b"top layer"];
        let config = config_for(&layers);

        write(&archive, "demo:v1", &config, &layers).unwrap();
        let image = load(&archive, &blobs).unwrap();

        assert_eq!(image.digest, Digest::of(&config));
        assert_eq!(image.layers.len(), 2);
        assert_eq!(image.layers[0].digest(), &Digest::of(b"base layer"));
        assert_eq!(fs::read(image.layers[1].path()).unwrap(), b"top layer");
        assert_eq!(image.diff_ids(), &[Digest::of(b"base layer"), Digest::of(b"top layer")]);

        // No staging leftovers.
        let leftovers = fs::read_dir(blobs.join("sha256"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);

        let config = read_config(&archive).unwrap();
        assert_eq!(config.rootfs.diff_ids.len(), 2);
    }

    #[test]
    fn test_write_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("image.tar");
        fs::write(&archive, b"keep me").unwrap();

        let err = write(&archive, "demo:v1", b"{}", &[]).unwrap_err();
        assert!(matches!(err, ImageError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
        assert_eq!(fs::read(&archive).unwrap(), b"keep me");
    }

    #[test]
    fn test_load_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("plain.tar");
        let mut builder = Builder::new(File::create(&archive).unwrap());
        append(&mut builder, "hello.txt", b"hi").unwrap();
        builder.finish().unwrap();

        let err = load(&archive, &dir.path().join("blobs")).unwrap_err();
        assert!(matches!(err, ImageError::Tarball { .. }), "{err}");
    }

    #[test]
    fn test_load_with_missing_layer() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.tar");
        let manifest = r#"[{"Config":"c.json","RepoTags":null,"Layers":["gone/layer.tar"]}]"#;
        let mut builder = Builder::new(File::create(&archive).unwrap());
        append(&mut builder, "c.json", &config_for(&[b"x".as_slice()])).unwrap();
        append(&mut builder, MANIFEST_FILE, manifest.as_bytes()).unwrap();
        builder.finish().unwrap();

        let err = load(&archive, &dir.path().join("blobs")).unwrap_err();
        assert!(err.to_string().contains("gone/layer.tar"), "{err}");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./manifest.json"), "manifest.json");
        assert_eq!(normalize("abc/layer.tar"), "abc/layer.tar");
    }
}
