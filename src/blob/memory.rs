//! In-memory blob store (non-persistent).

use super::{BlobError, BlobPath, BlobStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobPath, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, path: &BlobPath, data: Vec<u8>) -> Result<(), BlobError> {
        if path.is_empty() {
            return Err(BlobError::InvalidPath(path.clone()));
        }
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(path) {
            return Err(BlobError::AlreadyExists(path.clone()));
        }
        blobs.insert(path.clone(), data);
        Ok(())
    }

    async fn get(&self, path: &BlobPath) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(path.clone()))
    }

    async fn exists(&self, path: &BlobPath) -> Result<bool, BlobError> {
        Ok(self.blobs.read().await.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_is_write_once() {
        let store = InMemoryBlobStore::new();
        let path = BlobPath::new("a/b");
        store.put(&path, b"one".to_vec()).await.unwrap();

        let err = store.put(&path, b"two".to_vec()).await.unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists(_)));
        assert_eq!(store.get(&path).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let store = InMemoryBlobStore::new();
        let err = store.get(&BlobPath::new("nope")).await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
        assert!(!store.exists(&BlobPath::new("nope")).await.unwrap());
    }
}
