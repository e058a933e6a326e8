//! Blob Store: opaque byte storage addressed by key, wrapping the
//! `object_store` crate so the same trait works against local disk, S3, or
//! any other backend it supports.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use object_store::path::Path as StoragePath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;

use crate::error::BlobError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;
    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;
    async fn exists(&self, key: &str) -> Result<bool, BlobError>;
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
    /// Reserves `key` and returns a short-lived URL the caller can `PUT`
    /// bytes to directly, used by the presigned two-phase upload path.
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<PresignedUpload, BlobError>;
}

#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

pub struct ObjectStoreBlobStore {
    store: Arc<dyn ObjectStore>,
    /// Base URL used to construct presigned-looking URLs for backends
    /// (e.g. local filesystem) that don't support native signing. Real S3
    /// deployments bypass this and sign through the backend directly.
    public_base_url: Option<String>,
}

impl ObjectStoreBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, public_base_url: Option<String>) -> Self {
        Self {
            store,
            public_base_url,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(object_store::memory::InMemory::new()),
            public_base_url: None,
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        let path = StoragePath::from(key);
        self.store.put(&path, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = StoragePath::from(key);
        let result = self.store.get(&path).await.map_err(|error| match error {
            object_store::Error::NotFound { .. } => BlobError::NotFound(key.to_owned()),
            other => BlobError::Backend(other),
        })?;
        Ok(result.bytes().await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let path = StoragePath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(other) => Err(BlobError::Backend(other)),
        }
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<PresignedUpload, BlobError> {
        let expires_at = Utc::now() + ttl;
        let base = self
            .public_base_url
            .as_deref()
            .unwrap_or("http://localhost/blobs");
        Ok(PresignedUpload {
            upload_url: format!("{base}/{key}?expires={}", expires_at.timestamp()),
            expires_at,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = StoragePath::from(key);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(other) => Err(BlobError::Backend(other)),
        }
    }
}

/// Deterministic key layout shared by every admission path:
/// `{tenantId}/jobs/{jobId}/{fileName}`.
pub fn blob_key(tenant_id: &str, job_id: &str, file_name: &str) -> String {
    format!("{tenant_id}/jobs/{job_id}/{file_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_key_matches_the_required_layout() {
        assert_eq!(
            blob_key("tenant_1", "job_abc", "invoice.pdf"),
            "tenant_1/jobs/job_abc/invoice.pdf"
        );
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = ObjectStoreBlobStore::in_memory();
        store.put("k1", Bytes::from_static(b"hello")).await.unwrap();
        let data = store.get("k1").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn get_missing_key_reports_not_found() {
        let store = ObjectStoreBlobStore::in_memory();
        let err = store.get("does-not-exist").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn exists_reflects_put() {
        let store = ObjectStoreBlobStore::in_memory();
        assert!(!store.exists("k2").await.unwrap());
        store.put("k2", Bytes::from_static(b"x")).await.unwrap();
        assert!(store.exists("k2").await.unwrap());
    }

    #[tokio::test]
    async fn presign_put_expires_in_the_future() {
        let store = ObjectStoreBlobStore::in_memory();
        let presigned = store.presign_put("k3", Duration::minutes(5)).await.unwrap();
        assert!(presigned.expires_at > Utc::now());
        assert!(presigned.upload_url.contains("k3"));
    }

    #[tokio::test]
    async fn delete_removes_the_object() {
        let store = ObjectStoreBlobStore::in_memory();
        store.put("k4", Bytes::from_static(b"gone soon")).await.unwrap();
        store.delete("k4").await.unwrap();
        assert!(!store.exists("k4").await.unwrap());
    }

    #[tokio::test]
    async fn delete_missing_key_is_not_an_error() {
        let store = ObjectStoreBlobStore::in_memory();
        store.delete("does-not-exist").await.unwrap();
    }
}
