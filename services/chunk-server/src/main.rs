//! casnap chunk server
//!
//! Answers `GET /{prefix}/{key}.cacnk` from a tiered cache:
//!
//! - **Memory**: bounded in-process cache
//! - **Disk**: LRU-evicted local files, reconciled by a background GC loop
//! - **Peer**: placeholder, never hits
//! - **Remote**: the authoritative object store
//!
//! Hits in slower tiers are written back to faster ones in the background.

use std::sync::Arc;

use anyhow::{Context, Result};
use casnap_chunk_server::{api, config};
use casnap_store::{Chain, DiskTier, MemoryTier, PeerTier, RemoteTier, Store};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CASNAP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting casnap chunk server");
    info!(
        listen_addr = %config.listen_addr,
        disk_root = %config.disk.root.display(),
        disk_max_bytes = config.disk.max_bytes,
        memcache_bytes = config.memcache_bytes,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let memory = MemoryTier::new(config.memcache_bytes);
    let disk = DiskTier::open(config.disk.clone())
        .await
        .context("open disk tier")?;
    let backend = config
        .backend
        .connect()
        .await
        .context("connect object backend")?;
    let remote = RemoteTier::chunks(backend, &config.prefix);

    let tiers: Vec<Arc<dyn Store>> = vec![
        Arc::new(memory),
        Arc::new(disk.clone()),
        Arc::new(PeerTier::new()),
        Arc::new(remote),
    ];
    let chain = Chain::new(tiers);
    info!(tiers = ?chain.tiers(), "Tiered cache ready");

    let gc_handle = tokio::spawn(disk.run_gc_loop(shutdown_rx.clone()));

    let app = api::create_router(api::AppState::new(Arc::new(chain)));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, gc_handle).await {
        warn!(error = %e, "Disk GC loop did not shut down in time");
    }

    info!("Chunk server shutdown complete");
    Ok(())
}
