//! casnapctl - build and mount chunked image snapshots.
//!
//! `convert` turns a container image into a squashfs file, splits it into
//! content-addressed chunks in the object store, and publishes a seed image
//! naming the chunk index. `mount` resolves a seed image back to its index,
//! serves the squashfs file from the chunk cache over FUSE and mounts it.

mod commands;
mod error;

use anyhow::Result;
use clap::Parser;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
