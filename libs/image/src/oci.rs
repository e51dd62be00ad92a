//! OCI registry client.
//!
//! Implements the parts of the OCI Distribution Specification casnap needs:
//! manifest and blob pulls, monolithic blob uploads and manifest pushes.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::{repository_scope, Challenge, TokenResponse};
use crate::digest::Digest;
use crate::error::OciError;
use crate::manifest::{
    Manifest, ManifestIndex, Platform, DOCKER_MANIFEST_LIST, MANIFEST_ACCEPT, OCI_INDEX,
};
use crate::reference::{Authenticator, Reference, RegistryRef};

const PULL: &str = "pull";
const PUSH: &str = "pull,push";

/// Configuration for the OCI client.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Directory to store blobs, laid out as `<algorithm>/<hex>`.
    pub blob_dir: PathBuf,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Largest blob accepted.
    pub max_blob_size: u64,
    /// Platform picked from multi-platform indexes.
    pub platform: Platform,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("/var/lib/casnap/blobs"),
            request_timeout: Duration::from_secs(1800),
            max_blob_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            platform: Platform::current(),
        }
    }
}

/// OCI Distribution client.
pub struct OciClient {
    config: OciConfig,
    client: Client,
    /// Bearer tokens keyed by `registry/repository`.
    tokens: Mutex<HashMap<String, String>>,
    staging_seq: AtomicU64,
}

impl OciClient {
    pub fn new(config: OciConfig) -> Result<Self, OciError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("casnap/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            client,
            tokens: Mutex::new(HashMap::new()),
            staging_seq: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &OciConfig {
        &self.config
    }

    /// Pull the image manifest for `target`, resolving multi-platform indexes
    /// to the configured platform.
    ///
    /// Returns the manifest digest and the manifest. When `target` names a
    /// digest, the body is verified against it.
    pub async fn pull_manifest(
        &self,
        target: &RegistryRef,
    ) -> Result<(Digest, Manifest), OciError> {
        let (digest, media_type, body) = self.fetch_manifest(target).await?;

        if is_index(media_type.as_deref(), &body) {
            let index: ManifestIndex = serde_json::from_slice(&body)?;
            let chosen = index.select(&self.config.platform).ok_or_else(|| {
                OciError::NotFound(format!(
                    "{target} for platform {}/{}",
                    self.config.platform.os, self.config.platform.architecture
                ))
            })?;
            debug!(image = %target, digest = %chosen.digest, "Resolved platform manifest");
            let by_digest = target.with_reference(Reference::Digest(chosen.digest.clone()));
            let (digest, _, body) = self.fetch_manifest(&by_digest).await?;
            return Ok((digest, serde_json::from_slice(&body)?));
        }

        Ok((digest, serde_json::from_slice(&body)?))
    }

    async fn fetch_manifest(
        &self,
        target: &RegistryRef,
    ) -> Result<(Digest, Option<String>, Bytes), OciError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            target.base_url(),
            target.repository,
            target.reference
        );
        debug!(url = %url, "Pulling manifest");

        let response = self
            .send(target, PULL, || {
                self.client.get(&url).header(ACCEPT, MANIFEST_ACCEPT)
            })
            .await?;

        match response.status() {
            StatusCode::OK => {
                let media_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
                let body = response.bytes().await?;

                let computed = Digest::of(&body);
                if let Reference::Digest(expected) = &target.reference {
                    if &computed != expected {
                        return Err(OciError::DigestMismatch {
                            expected: expected.to_string(),
                            actual: computed.to_string(),
                        });
                    }
                }
                Ok((computed, media_type, body))
            }
            StatusCode::NOT_FOUND => Err(OciError::NotFound(target.to_string())),
            status => Err(OciError::Status {
                op: "pull manifest",
                status,
            }),
        }
    }

    /// Fetch a small blob (such as an image config) into memory, verifying
    /// its digest.
    pub async fn fetch_blob(
        &self,
        target: &RegistryRef,
        digest: &Digest,
    ) -> Result<Bytes, OciError> {
        let url = self.blob_url(target, digest);
        let response = self.send(target, PULL, || self.client.get(&url)).await?;
        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let computed = Digest::of(&body);
                if &computed != digest {
                    return Err(OciError::DigestMismatch {
                        expected: digest.to_string(),
                        actual: computed.to_string(),
                    });
                }
                Ok(body)
            }
            StatusCode::NOT_FOUND => Err(OciError::NotFound(digest.to_string())),
            status => Err(OciError::Status {
                op: "fetch blob",
                status,
            }),
        }
    }

    /// Pull a blob into the local blob directory. Existing blobs are reused.
    ///
    /// The blob is streamed to a staging file, verified, then renamed into
    /// place, so a blob present at [`blob_path`](Self::blob_path) is complete.
    pub async fn pull_blob(
        &self,
        target: &RegistryRef,
        digest: &Digest,
    ) -> Result<PathBuf, OciError> {
        let dest = self.blob_path(digest);
        if self.blob_exists(digest) {
            debug!(digest = %digest, "Blob already present");
            return Ok(dest);
        }

        let url = self.blob_url(target, digest);
        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let mut response = self.send(target, PULL, || self.client.get(&url)).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(OciError::NotFound(digest.to_string())),
            status => {
                return Err(OciError::Status {
                    op: "pull blob",
                    status,
                })
            }
        }

        if let Some(size) = response.content_length() {
            if size > self.config.max_blob_size {
                return Err(OciError::TooLarge {
                    size,
                    limit: self.config.max_blob_size,
                });
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = self.staging_path(&dest);
        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            let mut hasher = Sha256::new();
            let mut total_bytes = 0u64;

            while let Some(chunk) = response.chunk().await? {
                total_bytes += chunk.len() as u64;
                if total_bytes > self.config.max_blob_size {
                    return Err(OciError::TooLarge {
                        size: total_bytes,
                        limit: self.config.max_blob_size,
                    });
                }
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            drop(file);

            let computed = Digest::from_hasher(hasher);
            if &computed != digest {
                return Err(OciError::DigestMismatch {
                    expected: digest.to_string(),
                    actual: computed.to_string(),
                });
            }
            tokio::fs::rename(&temp_path, &dest).await?;
            Ok(total_bytes)
        }
        .await;

        match result {
            Ok(size) => {
                info!(digest = %digest, size, "Blob downloaded");
                Ok(dest)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    /// Whether the registry already has a blob.
    pub async fn blob_exists_remote(
        &self,
        target: &RegistryRef,
        digest: &Digest,
    ) -> Result<bool, OciError> {
        let url = self.blob_url(target, digest);
        let response = self.send(target, PUSH, || self.client.head(&url)).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(OciError::Status {
                op: "check blob",
                status,
            }),
        }
    }

    /// Upload a blob with a monolithic POST + PUT. Blobs the registry already
    /// has are skipped.
    pub async fn push_blob(
        &self,
        target: &RegistryRef,
        digest: &Digest,
        data: Bytes,
    ) -> Result<(), OciError> {
        if self.blob_exists_remote(target, digest).await? {
            debug!(digest = %digest, "Blob already in registry");
            return Ok(());
        }

        let start = format!("{}/v2/{}/blobs/uploads/", target.base_url(), target.repository);
        let response = self.send(target, PUSH, || self.client.post(&start)).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(OciError::Status {
                op: "start upload",
                status: response.status(),
            });
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| OciError::Protocol("upload response without Location".to_string()))?;
        let mut upload = Url::parse(&start)
            .and_then(|base| base.join(location))
            .map_err(|e| OciError::Protocol(format!("bad upload location {location:?}: {e}")))?;
        upload
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());

        let size = data.len();
        let response = self
            .send(target, PUSH, || {
                self.client
                    .put(upload.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT | StatusCode::OK => {
                info!(image = %target, digest = %digest, size, "Blob uploaded");
                Ok(())
            }
            status => Err(OciError::Status {
                op: "finish upload",
                status,
            }),
        }
    }

    /// Push a manifest under the reference of `target`. Returns its digest.
    pub async fn push_manifest(
        &self,
        target: &RegistryRef,
        media_type: &str,
        body: Bytes,
    ) -> Result<Digest, OciError> {
        let digest = Digest::of(&body);
        let url = format!(
            "{}/v2/{}/manifests/{}",
            target.base_url(),
            target.repository,
            target.reference
        );
        let response = self
            .send(target, PUSH, || {
                self.client
                    .put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(body.clone())
            })
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                info!(image = %target, digest = %digest, "Manifest pushed");
                Ok(digest)
            }
            status => Err(OciError::Status {
                op: "push manifest",
                status,
            }),
        }
    }

    /// Local path for a blob.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        blob_path(&self.config.blob_dir, digest)
    }

    /// Whether a blob is present locally.
    pub fn blob_exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    pub(crate) fn staging_path(&self, dest: &Path) -> PathBuf {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!(".{name}.{}.{seq}.partial", std::process::id()))
    }

    fn blob_url(&self, target: &RegistryRef, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            target.base_url(),
            target.repository,
            digest
        )
    }

    /// Send a request, answering one authentication challenge if the
    /// registry issues it.
    async fn send<F>(
        &self,
        target: &RegistryRef,
        actions: &str,
        build: F,
    ) -> Result<Response, OciError>
    where
        F: Fn() -> RequestBuilder,
    {
        let cache_key = format!("{}/{}", target.registry, target.repository);
        let cached = self.tokens.lock().await.get(&cache_key).cloned();
        let request = match &cached {
            Some(token) => build().bearer_auth(token),
            None => build(),
        };
        let response = request.send().await.map_err(map_send_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse);
        let retry = match challenge {
            Some(Challenge::Bearer { realm, service, .. }) => {
                let scope = repository_scope(&target.repository, actions);
                let token = self
                    .fetch_token(&target.auth, &realm, service.as_deref(), &scope)
                    .await?;
                self.tokens.lock().await.insert(cache_key, token.clone());
                build().bearer_auth(token)
            }
            Some(Challenge::Basic) if target.auth != Authenticator::Anonymous => {
                target.auth.apply(build())
            }
            _ => return Err(OciError::AuthRequired(target.to_string())),
        };

        let response = retry.send().await.map_err(map_send_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(OciError::AuthRequired(target.to_string()));
        }
        Ok(response)
    }

    async fn fetch_token(
        &self,
        auth: &Authenticator,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<String, OciError> {
        let mut query = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }
        debug!(realm = %realm, scope = %scope, "Requesting registry token");

        let response = auth
            .apply(self.client.get(realm).query(&query))
            .send()
            .await
            .map_err(map_send_error)?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(OciError::AuthRequired(scope.to_string()))
            }
            status => {
                return Err(OciError::Status {
                    op: "fetch token",
                    status,
                })
            }
        }
        let body: TokenResponse = serde_json::from_slice(&response.bytes().await?)?;
        body.into_token()
            .ok_or_else(|| OciError::Protocol("token response without a token".to_string()))
    }
}

/// `<dir>/<algorithm>/<hex>`.
pub fn blob_path(blob_dir: &Path, digest: &Digest) -> PathBuf {
    blob_dir.join(digest.algorithm()).join(digest.hex())
}

fn is_index(media_type: Option<&str>, body: &[u8]) -> bool {
    match media_type {
        Some(OCI_INDEX) | Some(DOCKER_MANIFEST_LIST) => true,
        Some(_) => false,
        // Some registries omit the header; an index has `manifests`.
        None => serde_json::from_slice::<serde_json::Value>(body)
            .map(|v| v.get("manifests").is_some())
            .unwrap_or(false),
    }
}

fn map_send_error(e: reqwest::Error) -> OciError {
    if e.is_timeout() {
        OciError::Timeout
    } else {
        OciError::Http(e)
    }
}
