//! Configuration for the chunk server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use casnap_store::{BackendConfig, DiskTierConfig, S3Config};

const MIB: u64 = 1024 * 1024;

/// Chunk server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Memory tier budget in bytes.
    pub memcache_bytes: u64,

    pub disk: DiskTierConfig,

    pub backend: BackendConfig,

    /// Key prefix inside the backend; chunks live under `<prefix>/chunk/`.
    pub prefix: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CASNAP_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8996".to_string())
            .parse()
            .context("CASNAP_LISTEN_ADDR")?;

        let log_level = std::env::var("CASNAP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let memcache_bytes = env_parse("CASNAP_MEMCACHE_MIB", 1024u64)? * MIB;

        let disk_defaults = DiskTierConfig::default();
        let disk = DiskTierConfig {
            root: std::env::var("CASNAP_DISKCACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(disk_defaults.root),
            max_bytes: env_parse("CASNAP_DISKCACHE_MAX_MIB", 1024u64)? * MIB,
            clean_interval: Duration::from_secs(env_parse(
                "CASNAP_DISKCACHE_CLEAN_INTERVAL_SECS",
                disk_defaults.clean_interval.as_secs(),
            )?),
        };

        let backend = backend_from_env()?;
        let prefix = std::env::var("CASNAP_S3_PREFIX").unwrap_or_default();

        Ok(Self {
            listen_addr,
            log_level,
            memcache_bytes,
            disk,
            backend,
            prefix,
        })
    }
}

fn backend_from_env() -> Result<BackendConfig> {
    let kind = std::env::var("CASNAP_STORE").unwrap_or_else(|_| "s3".to_string());
    match kind.as_str() {
        "local" => Ok(BackendConfig::Local {
            root: std::env::var("CASNAP_STORE_LOCAL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./store")),
        }),
        "s3" => {
            let bucket = std::env::var("CASNAP_S3_BUCKET")
                .context("CASNAP_S3_BUCKET is required when CASNAP_STORE=s3")?;
            let defaults = S3Config::default();
            Ok(BackendConfig::S3(S3Config {
                bucket,
                region: std::env::var("CASNAP_S3_REGION").ok(),
                endpoint: std::env::var("CASNAP_S3_ENDPOINT").ok(),
                force_path_style: std::env::var("CASNAP_S3_PATH_STYLE")
                    .map(|v| v == "1" || v.to_lowercase() == "true")
                    .unwrap_or(false),
                max_concurrency: env_parse("CASNAP_S3_CONCURRENCY", defaults.max_concurrency)?,
                ..defaults
            }))
        }
        other => bail!("CASNAP_STORE must be \"s3\" or \"local\", got {other:?}"),
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("{name}={value:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_default_and_invalid() {
        assert_eq!(
            env_parse("CASNAP_TEST_SURELY_UNSET_VARIABLE", 7u64).unwrap(),
            7
        );

        std::env::set_var("CASNAP_TEST_ENV_PARSE_INVALID", "lots");
        let err = env_parse("CASNAP_TEST_ENV_PARSE_INVALID", 7u64).unwrap_err();
        assert!(err.to_string().contains("CASNAP_TEST_ENV_PARSE_INVALID"));
    }
}
