//! Object-store contract and the local drivers that ship with the builder.
//!
//! S3-compatible backends live behind [`ObjectStore`]; the builder only
//! ever puts and gets whole objects under content-addressed keys.

use crate::errors::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;

/// Storage key scoping an app's pushed objects: `home/<app>:git-<short>`.
pub fn git_key(app: &str, short_sha: &str) -> String {
    format!("home/{app}:git-{short_sha}")
}

/// Storage key of the uploaded source archive for one push.
pub fn tar_key(app: &str, short_sha: &str) -> String {
    format!("{}/tar", git_key(app, short_sha))
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_content(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;
    async fn get_content(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// In-memory object store. The unit and integration tests build on it;
/// nothing survives the process.
#[derive(Default)]
pub struct InMemoryStore {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, for test assertions.
    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn put_content(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get_content(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }
}

/// Filesystem-backed object store rooted at a local directory. Keys map
/// to paths below the root.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn put_content(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::Put {
                    key: key.to_string(),
                    message: err.to_string(),
                })?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|err| StorageError::Put {
                key: key.to_string(),
                message: err.to_string(),
            })
    }

    async fn get_content(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(StorageError::Get {
                key: key.to_string(),
                message: err.to_string(),
            }),
        }
    }
}
