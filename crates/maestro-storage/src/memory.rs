use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::port::ObjectStore;

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    #[allow(dead_code)]
    mime_type: String,
}

/// In-process backend for tests and the development profile.
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put_object(&self, key: &str, bytes: Vec<u8>, mime_type: &str) -> Result<()> {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                mime_type: mime_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get_object_bytes(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn get_presigned_download(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.objects.contains_key(key) {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryObjectStore::new();
        store
            .put_object("asset/t1/a/file.png", b"png-bytes".to_vec(), "image/png")
            .await
            .unwrap();
        let bytes = store.get_object_bytes("asset/t1/a/file.png").await.unwrap();
        assert_eq!(bytes, b"png-bytes");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get_object_bytes("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn presign_requires_the_object() {
        let store = MemoryObjectStore::new();
        assert!(store
            .get_presigned_download("nope", Duration::from_secs(60))
            .await
            .is_err());

        store
            .put_object("asset/t1/a/f.txt", b"x".to_vec(), "text/plain")
            .await
            .unwrap();
        let url = store
            .get_presigned_download("asset/t1/a/f.txt", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("memory://asset/t1/a/f.txt"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryObjectStore::new();
        store
            .put_object("k", b"v".to_vec(), "application/octet-stream")
            .await
            .unwrap();
        store.delete_object("k").await.unwrap();
        store.delete_object("k").await.unwrap();
        assert!(store.is_empty());
    }
}
