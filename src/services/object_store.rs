//! Object storage behind a small trait.
//!
//! `ObjectStore` is exactly the surface the image service needs: put, get,
//! existence probe, and a readiness check. `S3ObjectStore` is the production
//! implementation over an S3-compatible API; tests swap in an in-memory map.
//! Listing is deliberately absent; the metadata table is the source of truth
//! for what exists.

use crate::config::AppConfig;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Blob operations against a single bucket-like namespace.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes at `key`, overwriting any prior object.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<()>;

    /// Download the full object at `key`.
    async fn get(&self, key: &str) -> StoreResult<Bytes>;

    /// Cheap existence probe used by the derived-variant cache.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Readiness probe: verifies the backing store is reachable.
    async fn ready(&self) -> StoreResult<()>;
}

/// S3 client bound to a single bucket.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS environment (credentials, region).
    ///
    /// A custom endpoint switches on path-style addressing, which MinIO and
    /// most other S3-compatible stores expect.
    pub async fn connect(cfg: &AppConfig) -> Self {
        let shared = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = cfg.s3_endpoint.as_deref() {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Self {
            client,
            bucket: cfg.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.into_service_error().to_string()))?;

        debug!(bucket = %self.bucket, key, "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Unavailable(service_err.to_string())
                }
            })?;

        let body = resp
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(body.into_bytes())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StoreError::Unavailable(service_err.to_string()))
                }
            }
        }
    }

    async fn ready(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.into_service_error().to_string()))?;
        Ok(())
    }
}
