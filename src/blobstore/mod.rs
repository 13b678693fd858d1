//! Blob storage adapter for fetching and publishing opaque byte objects.
//!
//! Source documents, reference workbooks and exported artifacts all live in an
//! S3-compatible object store reached through an HTTP gateway. The pipeline only
//! depends on the [`BlobStore`] trait so tests can substitute an in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors raised by blob storage backends.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// The requested object does not exist.
    #[error("Object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket that was queried.
        bucket: String,
        /// Object key that was queried.
        key: String,
    },
    /// The backend rejected the caller's credentials.
    #[error("Access denied for {bucket}/{key}")]
    AccessDenied {
        /// Bucket that was queried.
        bucket: String,
        /// Object key that was queried.
        key: String,
    },
    /// The backend failed in a way that may succeed on retry.
    #[error("Blob store request failed: {0}")]
    Transient(String),
}

/// Interface implemented by blob storage backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the raw bytes of an object.
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobStoreError>;

    /// Store an object, overwriting any existing content.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        media_type: Option<&str>,
    ) -> Result<(), BlobStoreError>;
}

/// Blob store backed by an S3-compatible HTTP gateway.
///
/// Objects are addressed as `{base_url}/{bucket}/{key}`; an optional API key is
/// forwarded on every request. Status mapping follows the error taxonomy:
/// 404 is `NotFound`, 401/403 is `AccessDenied`, everything else (including
/// transport failures) is `Transient`.
pub struct HttpBlobStore {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
}

impl HttpBlobStore {
    /// Construct a gateway client with the supplied connection settings.
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BlobStoreError> {
        let client = Client::builder()
            .user_agent("agromine/blobstore")
            .timeout(timeout)
            .build()
            .map_err(|err| BlobStoreError::Transient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            bucket.trim_matches('/'),
            key.trim_start_matches('/')
        )
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            request.header("x-api-key", api_key)
        } else {
            request
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobStoreError> {
        tracing::debug!(bucket, key, "Fetching object from blob store");
        let response = self
            .apply_auth(self.client.get(self.object_url(bucket, key)))
            .send()
            .await
            .map_err(|err| BlobStoreError::Transient(err.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|err| BlobStoreError::Transient(err.to_string())),
            StatusCode::NOT_FOUND => Err(BlobStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BlobStoreError::AccessDenied {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status => {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(bucket, key, %status, "Blob fetch failed");
                Err(BlobStoreError::Transient(format!("{status}: {body}")))
            }
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        media_type: Option<&str>,
    ) -> Result<(), BlobStoreError> {
        tracing::debug!(bucket, key, size = bytes.len(), "Uploading object");
        let mut request = self
            .apply_auth(self.client.put(self.object_url(bucket, key)))
            .body(bytes);
        if let Some(media_type) = media_type {
            request = request.header("content-type", media_type.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|err| BlobStoreError::Transient(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BlobStoreError::AccessDenied {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            status => {
                let body = response.text().await.unwrap_or_default();
                tracing::error!(bucket, key, %status, "Blob upload failed");
                Err(BlobStoreError::Transient(format!("{status}: {body}")))
            }
        }
    }
}

/// In-memory blob store used by tests and local development.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<(String, String), Bytes>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without going through the async trait.
    pub fn seed(&self, bucket: &str, key: &str, bytes: Bytes) {
        self.objects
            .try_write()
            .expect("memory blob store is not contended during seeding")
            .insert((bucket.to_string(), key.to_string()), bytes);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, BlobStoreError> {
        self.objects
            .read()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
        media_type: Option<&str>,
    ) -> Result<(), BlobStoreError> {
        let _ = media_type;
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }
}
