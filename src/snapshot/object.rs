//! Object-store backed snapshot storage.
//!
//! Production wires an S3-compatible bucket through `AmazonS3Builder`; tests
//! hand in `object_store::memory::InMemory`. Not-found maps to absent, and
//! credential/permission failures degrade to absent with a warning so a
//! misconfigured bucket cannot take the actor down.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};

use crate::config::ObjectStoreConfig;

use super::{SnapshotError, SnapshotStore};

pub struct ObjectSnapshotStore {
    inner: Arc<dyn ObjectStore>,
}

impl ObjectSnapshotStore {
    /// Wrap any object store backend.
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    /// Build an S3-compatible backend from the configured credentials.
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self, SnapshotError> {
        let mut builder = AmazonS3Builder::new()
            .with_endpoint(config.endpoint.as_str())
            .with_bucket_name(config.bucket.as_str())
            .with_access_key_id(config.access_key.as_str())
            .with_secret_access_key(config.secret_key.as_str())
            .with_allow_http(true);
        if let Some(region) = &config.region {
            builder = builder.with_region(region.as_str());
        }
        let store = builder
            .build()
            .map_err(|e| SnapshotError::Store(e.to_string()))?;
        Ok(Self::new(Arc::new(store)))
    }
}

#[async_trait]
impl SnapshotStore for ObjectSnapshotStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), SnapshotError> {
        let path = ObjectPath::from(key);
        self.inner
            .put(&path, PutPayload::from(Bytes::from(bytes)))
            .await
            .map_err(|e| SnapshotError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SnapshotError> {
        let path = ObjectPath::from(key);
        match self.inner.get(&path).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| SnapshotError::Store(e.to_string()))?;
                Ok(Some(bytes.to_vec()))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e @ object_store::Error::PermissionDenied { .. })
            | Err(e @ object_store::Error::Unauthenticated { .. }) => {
                warn!("snapshot store denied access for {key}, treating as absent: {e}");
                Ok(None)
            }
            Err(e) => Err(SnapshotError::Store(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), SnapshotError> {
        let path = ObjectPath::from(key);
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(SnapshotError::Store(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> ObjectSnapshotStore {
        ObjectSnapshotStore::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_absent_is_none() {
        let store = store();
        assert!(store.get("snapshots/missing.snapshot").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = store();
        store.put("snapshots/d.snapshot", vec![1, 2, 3]).await.unwrap();
        let loaded = store.get("snapshots/d.snapshot").await.unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = store();
        store.put("k", vec![1]).await.unwrap();
        store.put("k", vec![2]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        store.put("k", vec![1]).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }
}
