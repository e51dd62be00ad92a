//! CLI commands.

mod convert;
mod mount;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use casnap_image::{OciClient, OciConfig};
use casnap_mount::{MountOptions, Tools};
use casnap_store::{BackendConfig, RemoteTier, S3Config};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// casnapctl - chunked, content-addressed image snapshots.
#[derive(Debug, Parser)]
#[command(name = "casnapctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, env = "CASNAP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Directory for downloaded image blobs.
    #[arg(long, global = true, env = "CASNAP_BLOB_DIR")]
    blob_dir: Option<PathBuf>,

    /// Concurrent chunk transfers.
    #[arg(long, global = true, env = "CASNAP_THREADS", default_value_t = 4)]
    threads: usize,

    /// Path to mksquashfs (searched in PATH when omitted).
    #[arg(long, global = true, env = "CASNAP_BIN_MKSQUASHFS")]
    bin_mksquashfs: Option<PathBuf>,

    /// Path to losetup (searched in PATH when omitted).
    #[arg(long, global = true, env = "CASNAP_BIN_LOSETUP")]
    bin_losetup: Option<PathBuf>,

    /// Seconds to wait for overlay and squashfs mounts to appear.
    #[arg(long, global = true, env = "CASNAP_MOUNT_TIMEOUT", default_value_t = 10)]
    mount_timeout: u64,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert an image into chunks and publish its seed image.
    Convert(convert::ConvertCommand),

    /// Mount the snapshot a seed image points to.
    Mount(mount::MountCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        init_tracing(&self.log_level);

        let ctx = CommandContext {
            blob_dir: self.blob_dir,
            threads: self.threads.max(1),
            bin_mksquashfs: self.bin_mksquashfs,
            bin_losetup: self.bin_losetup,
            mount_timeout: Duration::from_secs(self.mount_timeout),
            store: self.store,
        };

        match self.command {
            Commands::Convert(cmd) => cmd.run(ctx).await,
            Commands::Mount(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("casnapctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into());
    // stdout stays free for command output.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    S3,
    Local,
}

/// Where chunks and indexes are stored.
#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Object store backend.
    #[arg(long = "store", global = true, env = "CASNAP_STORE", value_enum, default_value = "s3")]
    kind: StoreKind,

    /// Root directory of the local backend.
    #[arg(long, global = true, env = "CASNAP_STORE_LOCAL_PATH", default_value = "./store")]
    store_local_path: PathBuf,

    #[arg(long, global = true, env = "CASNAP_S3_BUCKET")]
    s3_bucket: Option<String>,

    #[arg(long, global = true, env = "CASNAP_S3_REGION")]
    s3_region: Option<String>,

    /// Custom endpoint for S3-compatible stores.
    #[arg(long, global = true, env = "CASNAP_S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// Key prefix; objects live under `<prefix>/chunk/` and `<prefix>/index/`.
    #[arg(long, global = true, env = "CASNAP_S3_PREFIX", default_value = "")]
    s3_prefix: String,

    /// Concurrent multipart uploads per object.
    #[arg(long, global = true, env = "CASNAP_S3_CONCURRENCY", default_value_t = 8)]
    s3_concurrency: usize,

    /// Address buckets as `<endpoint>/<bucket>` instead of by subdomain.
    #[arg(long, global = true, env = "CASNAP_S3_PATH_STYLE")]
    s3_path_style: bool,
}

impl StoreArgs {
    fn backend_config(&self) -> Result<BackendConfig> {
        match self.kind {
            StoreKind::Local => Ok(BackendConfig::Local {
                root: self.store_local_path.clone(),
            }),
            StoreKind::S3 => {
                let bucket = self
                    .s3_bucket
                    .clone()
                    .context("--s3-bucket (or CASNAP_S3_BUCKET) is required with --store s3")?;
                Ok(BackendConfig::S3(S3Config {
                    bucket,
                    region: self.s3_region.clone(),
                    endpoint: self.s3_endpoint.clone(),
                    force_path_style: self.s3_path_style,
                    max_concurrency: self.s3_concurrency.max(1),
                    ..S3Config::default()
                }))
            }
        }
    }
}

/// The chunk and index namespaces of one backend.
pub struct RemoteStores {
    pub chunks: Arc<RemoteTier>,
    pub indexes: RemoteTier,
}

/// Shared command context.
pub struct CommandContext {
    pub blob_dir: Option<PathBuf>,
    pub threads: usize,
    pub bin_mksquashfs: Option<PathBuf>,
    pub bin_losetup: Option<PathBuf>,
    pub mount_timeout: Duration,
    pub store: StoreArgs,
}

impl CommandContext {
    /// Connect to the configured object backend.
    pub async fn remote_stores(&self) -> Result<RemoteStores> {
        let backend = self
            .store
            .backend_config()?
            .connect()
            .await
            .context("connect to object store")?;
        let prefix = self.store.s3_prefix.as_str();
        Ok(RemoteStores {
            chunks: Arc::new(RemoteTier::chunks(backend.clone(), prefix)),
            indexes: RemoteTier::indexes(backend, prefix),
        })
    }

    pub fn oci_client(&self) -> Result<OciClient> {
        let mut config = OciConfig::default();
        if let Some(dir) = &self.blob_dir {
            config.blob_dir = dir.clone();
        }
        OciClient::new(config).context("create registry client")
    }

    pub fn tools(&self) -> Result<Tools> {
        Tools::discover(self.bin_mksquashfs.clone(), self.bin_losetup.clone())
            .context("locate mksquashfs and losetup")
    }

    pub fn mount_options(&self) -> MountOptions {
        MountOptions::with_timeout(self.mount_timeout)
    }
}
