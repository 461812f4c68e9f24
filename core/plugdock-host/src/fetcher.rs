//! Package fetcher: download, checksum verification, caching, extraction.
//!
//! A blob is only ever written to the cache after its SHA-256 matches the
//! registry-declared checksum. Extraction always targets a fresh directory,
//! one per installation attempt.

use crate::cache::{BlobCache, cache_key, path_component};
use crate::error::{HostError, HostResult};
use crate::registry_client::RegistryClient;
use crate::resolver::ResolvedVersion;
use plugdock_package::{PluginPackage, checksum_matches, sha256_hex};
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A verified blob, from the cache or freshly downloaded.
#[derive(Debug, Clone)]
pub struct DownloadedPackage {
    pub plugin_id: String,
    pub version: Version,
    pub checksum: String,
    pub cache_key: String,
    pub cache_path: Option<PathBuf>,
    pub bytes: Vec<u8>,
    pub from_cache: bool,
}

/// A resolved, verified, cached and extracted package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArtifact {
    pub plugin_id: String,
    pub version: Version,
    pub checksum: String,
    pub cache_key: String,
    pub cache_path: Option<PathBuf>,
    pub extraction_path: PathBuf,
}

pub struct PackageFetcher {
    registry: Arc<dyn RegistryClient>,
    cache: Arc<dyn BlobCache>,
    work_dir: PathBuf,
}

impl PackageFetcher {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        cache: Arc<dyn BlobCache>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            cache,
            work_dir: work_dir.into(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn RegistryClient> {
        &self.registry
    }

    /// Download, verify, cache and extract in one go.
    pub async fn fetch(&self, plugin_id: &str, resolved: &ResolvedVersion) -> HostResult<PackageArtifact> {
        let download = self.download(plugin_id, resolved, &CancellationToken::new()).await?;
        let package = PluginPackage::from_bytes(&download.bytes)?;
        let extraction_path = self.extract(plugin_id, &download.version, &package).await?;
        Ok(PackageArtifact {
            plugin_id: download.plugin_id,
            version: download.version,
            checksum: download.checksum,
            cache_key: download.cache_key,
            cache_path: download.cache_path,
            extraction_path,
        })
    }

    /// Returns the verified blob for `resolved`, from cache when possible.
    ///
    /// A cached blob that no longer matches the declared checksum is evicted
    /// and downloaded again. A downloaded blob that does not match fails with
    /// `ChecksumMismatch` and is never cached. Cancellation aborts the
    /// transfer; nothing is written to the cache.
    pub async fn download(
        &self,
        plugin_id: &str,
        resolved: &ResolvedVersion,
        cancel: &CancellationToken,
    ) -> HostResult<DownloadedPackage> {
        let key = cache_key(plugin_id, &resolved.version);

        if let Some(bytes) = self.cache.get(&key).await? {
            let actual = sha256_hex(&bytes);
            if checksum_matches(&actual, &resolved.checksum) {
                debug!(plugin_id = %plugin_id, key = %key, "Package cache hit");
                return Ok(self.downloaded(plugin_id, resolved, key, bytes, true));
            }
            warn!(
                plugin_id = %plugin_id,
                key = %key,
                expected = %resolved.checksum,
                actual = %actual,
                "Cached package no longer matches its checksum, evicting"
            );
            self.cache.remove(&key).await?;
        }

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(plugin_id = %plugin_id, "Download cancelled");
                return Err(HostError::Cancelled(plugin_id.to_string()));
            }
            result = self.registry.fetch_blob(plugin_id, &resolved.version) => result?,
        };

        let actual = sha256_hex(&bytes);
        if !checksum_matches(&actual, &resolved.checksum) {
            error!(
                plugin_id = %plugin_id,
                key = %key,
                expected = %resolved.checksum,
                actual = %actual,
                "Package checksum mismatch, refusing artifact"
            );
            return Err(HostError::ChecksumMismatch {
                key,
                expected: resolved.checksum.clone(),
                actual,
            });
        }

        self.cache.put(&key, &bytes).await?;
        info!(plugin_id = %plugin_id, version = %resolved.version, size = bytes.len(), "Package downloaded and cached");
        Ok(self.downloaded(plugin_id, resolved, key, bytes, false))
    }

    fn downloaded(
        &self,
        plugin_id: &str,
        resolved: &ResolvedVersion,
        key: String,
        bytes: Vec<u8>,
        from_cache: bool,
    ) -> DownloadedPackage {
        DownloadedPackage {
            plugin_id: plugin_id.to_string(),
            version: resolved.version.clone(),
            checksum: resolved.checksum.to_ascii_lowercase(),
            cache_path: self.cache.path(&key),
            cache_key: key,
            bytes,
            from_cache,
        }
    }

    /// Extracts an opened package into a fresh working directory
    /// `<work_dir>/<plugin id>/<version>-<uuid>` and returns it.
    pub async fn extract(
        &self,
        plugin_id: &str,
        version: &Version,
        package: &PluginPackage,
    ) -> HostResult<PathBuf> {
        let target = self
            .work_dir
            .join(path_component(plugin_id))
            .join(format!("{}-{}", path_component(&version.to_string()), Uuid::new_v4().simple()));

        let package = package.clone();
        let dest = target.clone();
        let result = tokio::task::spawn_blocking(move || package.extract_to(&dest))
            .await
            .map_err(|e| HostError::Io(std::io::Error::other(e)))?;

        if let Err(e) = result {
            self.discard_extraction(&target).await;
            return Err(e.into());
        }
        debug!(plugin_id = %plugin_id, path = ?target, "Package extracted");
        Ok(target)
    }

    /// Evicts a cached blob. Returns true if one existed.
    pub async fn cleanup(&self, plugin_id: &str, version: &Version) -> HostResult<bool> {
        let removed = self.cache.remove(&cache_key(plugin_id, version)).await?;
        if removed {
            info!(plugin_id = %plugin_id, version = %version, "Evicted cached package");
        }
        Ok(removed)
    }

    /// Best-effort removal of an extraction directory.
    pub async fn discard_extraction(&self, path: &Path) {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => debug!(path = ?path, "Removed extraction directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?path, "Failed to remove extraction directory: {e}"),
        }
    }
}
