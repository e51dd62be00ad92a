//! Convert command (image to chunked squashfs).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use casnap_chunker::{chop, store_index, ChunkSizePolicy};
use casnap_image::{pull, push_seed, OciClient};
use casnap_mount::{mount, OverlayMounter, Tools};
use casnap_store::Store;
use clap::Args;
use tracing::{error, info};

use super::{CommandContext, RemoteStores};

/// Convert command - pull an image, flatten it into squashfs, chunk it
/// into the store and publish a seed image pointing at the index.
#[derive(Debug, Args)]
pub struct ConvertCommand {
    /// Source image: a registry reference, or `tarball:<path>` for a
    /// `docker save` archive.
    image: String,

    /// Destination of the seed image (registry reference or `tarball:<path>`).
    seed_image: String,

    /// Chunk size bounds in KiB, as min:avg:max.
    #[arg(long, env = "CASNAP_CHUNK_SIZE", default_value = "16:64:256")]
    chunk_size: ChunkSizePolicy,

    /// Parent directory for scratch space (system temp dir by default).
    #[arg(long, env = "CASNAP_WORK_DIR")]
    work_dir: Option<PathBuf>,
}

impl ConvertCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let tools = ctx.tools()?;
        let client = ctx.oci_client()?;
        let stores = ctx.remote_stores().await?;

        let work = scratch_dir(self.work_dir.as_deref())?;
        info!(image = %self.image, work_dir = %work.path().display(), "Converting image");

        let image = pull(&client, &self.image)
            .await
            .with_context(|| format!("pull {}", self.image))?;
        let image_digest = image.digest.clone();
        info!(digest = %image_digest, layers = image.layers.len(), "Pulled image");

        let squash = work.path().join("image.sqfs");
        {
            let overlay = OverlayMounter::new(
                image.layers,
                work.path().join("overlay"),
                work.path().join("rootfs"),
            );
            let rootfs = mount(Arc::new(overlay), ctx.mount_options())
                .await
                .context("mount image layers")?;

            let built = tools.make_squashfs(rootfs.target(), &squash).await;
            if let Err(e) = rootfs.unmount().await {
                error!(error = %e, "Failed to unmount image layers");
            }
            built.context("build squashfs")?;
        }

        let name = self
            .publish(&client, &stores, &squash, image_digest.hex(), ctx.threads)
            .await?;

        println!("{name}");
        Ok(())
    }

    /// Push the seed image and upload the chunks and index for `squash`.
    /// Returns the index name.
    async fn publish(
        &self,
        client: &OciClient,
        stores: &RemoteStores,
        squash: &Path,
        content: &str,
        threads: usize,
    ) -> Result<String> {
        let name = push_seed(client, &self.seed_image, content)
            .await
            .with_context(|| format!("push seed image {}", self.seed_image))?;
        info!(seed = %self.seed_image, index = %name, "Pushed seed image");

        let chunks: Arc<dyn Store> = stores.chunks.clone();
        let index = chop(squash, self.chunk_size, chunks, threads)
            .await
            .context("chunk squashfs image")?;
        store_index(&stores.indexes, &name, &index)
            .await
            .context("store chunk index")?;

        info!(
            index = %name,
            size = index.size,
            chunks = index.chunks.len(),
            "Stored chunk index"
        );
        Ok(name)
    }
}

pub(super) fn scratch_dir(parent: Option<&Path>) -> Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("casnap-");
    match parent {
        Some(dir) => builder.tempdir_in(dir),
        None => builder.tempdir(),
    }
    .context("create scratch directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_dir_under_parent_is_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let work = scratch_dir(Some(parent.path())).unwrap();
            assert!(work.path().starts_with(parent.path()));
            assert!(work
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("casnap-"));
            work.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_scratch_dir_in_missing_parent_fails() {
        let parent = tempfile::tempdir().unwrap();
        assert!(scratch_dir(Some(&parent.path().join("missing"))).is_err());
    }
}
