//! S3 object backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::ObjectBackend;
use crate::error::StoreError;

/// S3 backend configuration.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Region; falls back to the AWS default chain when unset.
    pub region: Option<String>,
    /// Custom endpoint URL (MinIO, Ceph RGW, ...).
    pub endpoint: Option<String>,
    /// Path-style addressing, needed by most S3-compatible services.
    pub force_path_style: bool,
    /// Objects larger than this go through multipart upload.
    pub part_size: usize,
    /// Concurrent part uploads per object.
    pub max_concurrency: usize,
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt.
    pub retry_base_delay: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: None,
            endpoint: None,
            force_path_style: false,
            part_size: 16 * 1024 * 1024, // 16 MiB
            max_concurrency: 8,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    config: S3Config,
}

impl S3Backend {
    /// Build a client from the AWS default provider chain plus `config`.
    pub async fn connect(config: S3Config) -> Result<Self, StoreError> {
        if config.bucket.is_empty() {
            return Err(StoreError::Backend("bucket name cannot be empty".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_base_delay * (1u32 << (attempt - 1).min(16))
    }

    async fn put_single(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .put_object()
                .bucket(&self.config.bucket)
                .key(key)
                .body(ByteStream::from(data.to_vec()))
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.config.max_retries => {
                    debug!(key, attempt, error = %DisplayErrorContext(&e), "Retrying S3 put");
                    sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(backend_error("put", key, e)),
            }
        }
    }

    async fn put_multipart(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("create multipart upload", key, e))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StoreError::Backend(format!("no upload id returned for {key}")))?
            .to_string();

        let mut guard = AbortGuard {
            client: self.client.clone(),
            bucket: self.config.bucket.clone(),
            key: key.to_string(),
            upload_id: upload_id.clone(),
            armed: true,
        };

        let sem = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let parts = data
            .chunks(self.config.part_size.max(1))
            .enumerate()
            .map(|(i, part)| {
                let part_number = i as i32 + 1;
                let body = part.to_vec();
                let sem = sem.clone();
                let upload_id = upload_id.as_str();
                async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    let mut attempt = 0;
                    loop {
                        attempt += 1;
                        let result = self
                            .client
                            .upload_part()
                            .bucket(&self.config.bucket)
                            .key(key)
                            .upload_id(upload_id)
                            .part_number(part_number)
                            .body(ByteStream::from(body.clone()))
                            .send()
                            .await;
                        match result {
                            Ok(out) => {
                                break Ok(CompletedPart::builder()
                                    .part_number(part_number)
                                    .set_e_tag(out.e_tag().map(str::to_string))
                                    .build())
                            }
                            Err(e) if attempt < self.config.max_retries => {
                                debug!(
                                    key,
                                    part_number,
                                    attempt,
                                    error = %DisplayErrorContext(&e),
                                    "Retrying S3 part upload"
                                );
                                sleep(self.backoff(attempt)).await;
                            }
                            Err(e) => break Err(backend_error("upload part", key, e)),
                        }
                    }
                }
            });

        let completed = futures_util::future::try_join_all(parts).await?;

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| backend_error("complete multipart upload", key, e))?;

        guard.armed = false;
        Ok(())
    }
}

/// Aborts an unfinished multipart upload when dropped while armed.
struct AbortGuard {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    armed: bool,
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        tokio::spawn(async move {
            if let Err(e) = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
            }
        });
    }
}

fn backend_error<E>(op: &str, key: &str, err: E) -> StoreError
where
    E: std::error::Error,
{
    StoreError::Backend(format!("s3 {op} {key}: {}", DisplayErrorContext(&err)))
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        if data.len() <= self.config.part_size {
            self.put_single(key, data).await
        } else {
            self.put_multipart(key, data).await
        }
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                return if missing {
                    Ok(None)
                } else {
                    Err(backend_error("get", key, e))
                };
            }
        };
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| backend_error("read body", key, e))?;
        Ok(Some(body.into_bytes().to_vec()))
    }

    async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .delete_object()
                .bucket(&self.config.bucket)
                .key(key)
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(_) if attempt < self.config.max_retries => {
                    sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(backend_error("delete", key, e)),
            }
        }
    }

    async fn exists_object(&self, key: &str) -> Result<bool, StoreError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if missing {
                    Ok(false)
                } else {
                    Err(backend_error("head", key, e))
                }
            }
        }
    }
}
