//! Blob cache for verified package artifacts, keyed by `pluginId@version`.
//!
//! Entries are write-once per version: a version's blob never changes, so
//! concurrent installs of the same version may share it.

use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// Cache key for one version of a plugin.
pub fn cache_key(plugin_id: &str, version: &semver::Version) -> String {
    format!("{plugin_id}@{version}")
}

/// Replaces every character outside `[A-Za-z0-9._@+-]` so an id or key can
/// be used as a single path component.
pub(crate) fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "._@+-".contains(c) { c } else { '_' })
        .collect();
    // "", "." and ".." would not name a child directory.
    if cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

/// Abstract blob store.
#[async_trait]
pub trait BlobCache: Send + Sync {
    async fn get(&self, key: &str) -> HostResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, bytes: &[u8]) -> HostResult<()>;

    /// Returns true if an entry was removed.
    async fn remove(&self, key: &str) -> HostResult<bool>;

    /// On-disk location of an entry, for stores that have one.
    fn path(&self, key: &str) -> Option<PathBuf>;
}

/// Blobs stored as files beneath a directory.
pub struct FsBlobCache {
    root: PathBuf,
}

impl FsBlobCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.pkg", path_component(key)))
    }
}

#[async_trait]
impl BlobCache for FsBlobCache {
    async fn get(&self, key: &str) -> HostResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.file_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostError::Cache(format!("read {key}: {e}"))),
        }
    }

    /// Writes to a temp file then renames, so readers never see a partial blob.
    async fn put(&self, key: &str, bytes: &[u8]) -> HostResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| HostError::Cache(format!("create {:?}: {e}", self.root)))?;

        let target = self.file_for(key);
        let temp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&temp, bytes)
            .await
            .map_err(|e| HostError::Cache(format!("write {key}: {e}")))?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(HostError::Cache(format!("commit {key}: {e}")));
        }
        debug!(key = %key, size = bytes.len(), "Cached blob");
        Ok(())
    }

    async fn remove(&self, key: &str) -> HostResult<bool> {
        match tokio::fs::remove_file(self.file_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HostError::Cache(format!("remove {key}: {e}"))),
        }
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        Some(self.file_for(key))
    }
}

/// Blobs held in memory.
#[derive(Default)]
pub struct MemoryBlobCache {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobCache for MemoryBlobCache {
    async fn get(&self, key: &str) -> HostResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> HostResult<()> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> HostResult<bool> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    fn path(&self, _key: &str) -> Option<PathBuf> {
        None
    }
}
