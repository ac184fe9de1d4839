//! Directory-backed blob store.

use super::{BlobError, BlobPath, BlobStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn new(root: PathBuf) -> Result<Self, BlobError> {
        fs::create_dir_all(&root)
            .await
            .map_err(|source| BlobError::Io {
                path: BlobPath::default(),
                source,
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a blob path onto the filesystem, rejecting anything that could
    /// escape the root.
    fn resolve(&self, path: &BlobPath) -> Result<PathBuf, BlobError> {
        if path.is_empty() {
            return Err(BlobError::InvalidPath(path.clone()));
        }
        let mut full = self.root.clone();
        for component in path.components() {
            if component == "." || component == ".." || component.contains('\\') {
                return Err(BlobError::InvalidPath(path.clone()));
            }
            full.push(component);
        }
        Ok(full)
    }
}

fn io_error(path: &BlobPath) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |source| BlobError::Io {
        path: path.clone(),
        source,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &BlobPath, data: Vec<u8>) -> Result<(), BlobError> {
        let target = self.resolve(path)?;
        if fs::try_exists(&target).await.map_err(io_error(path))? {
            return Err(BlobError::AlreadyExists(path.clone()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(io_error(path))?;
        }

        // Readers never observe a half-written blob.
        let tmp = target.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, data).await.map_err(io_error(path))?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(path)(e));
        }
        Ok(())
    }

    async fn get(&self, path: &BlobPath) -> Result<Vec<u8>, BlobError> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(path.clone()))
            }
            Err(err) => Err(io_error(path)(err)),
        }
    }

    async fn exists(&self, path: &BlobPath) -> Result<bool, BlobError> {
        let target = self.resolve(path)?;
        fs::try_exists(&target).await.map_err(io_error(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs")).await.unwrap();
        let path = BlobPath::new("jobs/42/state-1");

        store.put_string(&path, "hello").await.unwrap();
        assert_eq!(store.get_string(&path).await.unwrap(), "hello");
        assert!(dir.path().join("blobs/jobs/42/state-1").exists());
    }

    #[tokio::test]
    async fn test_second_put_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf()).await.unwrap();
        let path = BlobPath::new("x");
        store.put(&path, vec![1]).await.unwrap();
        assert!(matches!(
            store.put(&path, vec![2]).await,
            Err(BlobError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf()).await.unwrap();
        let err = store
            .put(&BlobPath::new("../escape"), vec![0])
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf()).await.unwrap();
        assert!(matches!(
            store.get(&BlobPath::new("missing")).await,
            Err(BlobError::NotFound(_))
        ));
    }
}
