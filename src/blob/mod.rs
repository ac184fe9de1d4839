//! Write-once blob storage for serialized task state and outputs.
//!
//! The scheduler never looks inside a blob. Task state goes in as bytes and
//! comes back out as bytes; outputs are UTF-8 strings stored the same way.
//!
//! Supports:
//! - `fs`: a directory tree on local (or network-mounted) disk
//! - `memory`: an in-process map (non-persistent, for testing)

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::InMemoryBlobStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A `/`-separated location inside a [`BlobStore`].
///
/// Paths are plain strings so they can be persisted inside task records
/// without caring which backend resolves them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobPath(String);

impl BlobPath {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self(path.trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Join one more component onto this path.
    pub fn append(&self, name: &str) -> BlobPath {
        let name = name.trim_matches('/');
        if self.0.is_empty() {
            BlobPath(name.to_string())
        } else {
            BlobPath(format!("{}/{}", self.0, name))
        }
    }

    /// Join a fresh, never-before-used component onto this path.
    ///
    /// # Postcondition
    /// The returned path has the form `<self>/<prefix>-<uuid>`.
    pub fn unique(&self, prefix: &str) -> BlobPath {
        self.append(&format!("{}-{}", prefix, Uuid::new_v4().simple()))
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(BlobPath),

    #[error("blob already exists: {0}")]
    AlreadyExists(BlobPath),

    #[error("invalid blob path: {0}")]
    InvalidPath(BlobPath),

    #[error("blob i/o error at {path}: {source}")]
    Io {
        path: BlobPath,
        #[source]
        source: std::io::Error,
    },

    #[error("blob {0} is not valid UTF-8")]
    NotUtf8(BlobPath),
}

/// Blob store trait - implemented by all storage backends.
///
/// # Invariants
/// - A path is written at most once; a second `put` fails with
///   [`BlobError::AlreadyExists`].
/// - `get` after a successful `put` returns exactly the bytes written.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` at `path`.
    async fn put(&self, path: &BlobPath, data: Vec<u8>) -> Result<(), BlobError>;

    /// Read the bytes stored at `path`.
    async fn get(&self, path: &BlobPath) -> Result<Vec<u8>, BlobError>;

    async fn exists(&self, path: &BlobPath) -> Result<bool, BlobError>;

    async fn put_string(&self, path: &BlobPath, value: &str) -> Result<(), BlobError> {
        self.put(path, value.as_bytes().to_vec()).await
    }

    async fn get_string(&self, path: &BlobPath) -> Result<String, BlobError> {
        let bytes = self.get(path).await?;
        String::from_utf8(bytes).map_err(|_| BlobError::NotUtf8(path.clone()))
    }
}
