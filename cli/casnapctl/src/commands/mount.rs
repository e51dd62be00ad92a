//! Mount command (seed image to read-only squashfs mount).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use casnap_chunker::load_index;
use casnap_image::pull_seed;
use casnap_mount::{
    fsutil, mount_index, mount_squashfs_file, MountHandle, INDEX_FILENAME,
};
use casnap_store::{Chain, MemoryTier, Store};
use clap::Args;
use tracing::{error, info};

use super::convert::scratch_dir;
use super::CommandContext;

const MIB: u64 = 1024 * 1024;

/// Mount command - resolve a seed image to its chunk index, serve the
/// squashfs image from chunks over FUSE and mount it at DIR until interrupted.
#[derive(Debug, Args)]
pub struct MountCommand {
    /// Seed image produced by `casnapctl convert`.
    seed_image: String,

    /// Mount point; must be absent or an empty directory.
    dir: PathBuf,

    /// Trust chunk contents without checking their digests.
    #[arg(long, env = "CASNAP_SKIP_VERIFY")]
    skip_verify: bool,

    /// In-memory chunk cache budget in MiB.
    #[arg(long, env = "CASNAP_MEMCACHE_MIB", default_value_t = 1024)]
    memcache_mib: u64,

    /// Parent directory for scratch space (system temp dir by default).
    #[arg(long, env = "CASNAP_WORK_DIR")]
    work_dir: Option<PathBuf>,
}

impl MountCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        check_mount_point(&self.dir).await?;

        let tools = ctx.tools()?;
        let client = ctx.oci_client()?;
        let stores = ctx.remote_stores().await?;

        let name = pull_seed(&client, &self.seed_image)
            .await
            .with_context(|| format!("pull seed image {}", self.seed_image))?;
        let index = load_index(&stores.indexes, &name)
            .await
            .with_context(|| format!("load chunk index {name}"))?;
        info!(index = %name, size = index.size, chunks = index.chunks.len(), "Resolved seed image");

        let memory: Arc<dyn Store> = Arc::new(MemoryTier::new(self.memcache_mib * MIB));
        let remote: Arc<dyn Store> = stores.chunks;
        let chain: Arc<dyn Store> = Arc::new(Chain::new(vec![memory, remote]));

        let work = scratch_dir(self.work_dir.as_deref())?;
        let index_dir = work.path().join("index");
        let mut index_mount = mount_index(
            index,
            chain,
            &index_dir,
            !self.skip_verify,
            ctx.mount_options(),
        )
        .await
        .context("mount chunk index")?;

        let mut squash_mount = match mount_squashfs_file(
            &tools.losetup(),
            &index_dir.join(INDEX_FILENAME),
            &self.dir,
            ctx.mount_options(),
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                release("index", index_mount).await;
                return Err(e).context("mount squashfs image");
            }
        };

        info!(seed = %self.seed_image, dir = %self.dir.display(), "Mounted snapshot");
        println!("{}", self.dir.display());

        let outcome = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                signal.context("listen for ctrl-c")
            }
            Some(e) = squash_mount.failed() => Err(anyhow!(e).context("squashfs mount failed")),
            Some(e) = index_mount.failed() => Err(anyhow!(e).context("index mount failed")),
        };

        // Reverse order of mounting: the squashfs reads the index file.
        let squash_ok = release("squashfs", squash_mount).await;
        let index_ok = release("index", index_mount).await;
        outcome?;
        if !(squash_ok && index_ok) {
            bail!("snapshot was not fully unmounted, see log for details");
        }
        Ok(())
    }
}

/// Fail before touching the registry or the chunk store.
async fn check_mount_point(dir: &Path) -> Result<()> {
    match tokio::fs::metadata(dir).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("inspect {}", dir.display())),
        Ok(meta) if !meta.is_dir() => bail!("{} is not a directory", dir.display()),
        Ok(_) if !fsutil::is_empty_dir(dir).await => {
            bail!("{} is not empty", dir.display())
        }
        Ok(_) => Ok(()),
    }
}

async fn release(kind: &str, handle: MountHandle) -> bool {
    let target = handle.target().to_path_buf();
    match handle.unmount().await {
        Ok(()) => true,
        Err(e) => {
            error!(kind, target = %target.display(), error = %e, "Failed to release mount");
            false
        }
    }
}
