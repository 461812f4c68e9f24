//! Package registry abstraction.
//!
//! The host only needs two calls from a registry: the list of published
//! versions with their checksums, and the blob for one version. Retry policy
//! belongs to the client implementation; the host never retries.

use crate::error::{HostError, HostResult};
use async_trait::async_trait;
use plugdock_package::sha256_hex;
use reqwest::Client;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One entry of a registry's version listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedVersion {
    pub version: String,
    /// SHA-256 of the blob, hex.
    pub checksum: String,
    /// Hex-encoded Ed25519 publisher key, if the publisher signs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
}

impl PublishedVersion {
    pub fn new(version: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            checksum: checksum.into(),
            signing_key: None,
        }
    }

    #[must_use]
    pub fn signed_by(mut self, key_hex: impl Into<String>) -> Self {
        self.signing_key = Some(key_hex.into());
        self
    }
}

/// Abstract registry interface.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Every published version of a plugin.
    async fn list_versions(&self, plugin_id: &str) -> HostResult<Vec<PublishedVersion>>;

    /// The raw package blob for one version.
    async fn fetch_blob(&self, plugin_id: &str, version: &Version) -> HostResult<Vec<u8>>;
}

/// Connection settings for [`HttpRegistryClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRegistryConfig {
    /// Base URL, e.g. `https://plugins.example.com/api`.
    pub base_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpRegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout_secs: 60,
            user_agent: format!("PlugDock/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Registry reached over HTTP.
///
/// - `GET {base}/plugins/{id}/versions` → JSON array of [`PublishedVersion`]
/// - `GET {base}/plugins/{id}/versions/{version}/download` → blob bytes
pub struct HttpRegistryClient {
    config: HttpRegistryConfig,
    client: Client,
}

impl HttpRegistryClient {
    pub fn new(config: HttpRegistryConfig) -> HostResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| HostError::Registry(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), tail)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_versions(&self, plugin_id: &str) -> HostResult<Vec<PublishedVersion>> {
        debug!(plugin_id = %plugin_id, "Listing published versions");

        let response = self
            .client
            .get(self.url(&format!("plugins/{plugin_id}/versions")))
            .send()
            .await
            .map_err(|e| HostError::Registry(format!("version list failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(HostError::PluginNotFound(plugin_id.to_string()));
        }
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(HostError::Registry(format!("version list failed: HTTP {status}: {error}")));
        }

        response
            .json()
            .await
            .map_err(|e| HostError::Registry(format!("failed to parse version list: {e}")))
    }

    async fn fetch_blob(&self, plugin_id: &str, version: &Version) -> HostResult<Vec<u8>> {
        debug!(plugin_id = %plugin_id, version = %version, "Downloading package");

        let response = self
            .client
            .get(self.url(&format!("plugins/{plugin_id}/versions/{version}/download")))
            .send()
            .await
            .map_err(|e| HostError::Network(format!("download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HostError::Registry(format!(
                "download of {plugin_id}@{version} failed: HTTP {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| HostError::Network(format!("read download body failed: {e}")))?;

        Ok(bytes.to_vec())
    }
}

/// In-process registry. Publishing computes the checksum from the blob.
#[derive(Default)]
pub struct MemoryRegistry {
    packages: Mutex<HashMap<String, Vec<(PublishedVersion, Vec<u8>)>>>,
    downloads: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a blob and returns its listing entry.
    pub fn publish(&self, plugin_id: &str, version: &str, blob: Vec<u8>) -> PublishedVersion {
        self.publish_entry(plugin_id, PublishedVersion::new(version, sha256_hex(&blob)), blob)
    }

    /// Publishes a blob under an explicit listing entry, which may declare
    /// any checksum.
    pub fn publish_entry(&self, plugin_id: &str, entry: PublishedVersion, blob: Vec<u8>) -> PublishedVersion {
        let mut packages = self.packages.lock().unwrap_or_else(PoisonError::into_inner);
        let versions = packages.entry(plugin_id.to_string()).or_default();
        versions.retain(|(p, _)| p.version != entry.version);
        versions.push((entry.clone(), blob));
        entry
    }

    /// Number of `fetch_blob` calls served so far.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn list_versions(&self, plugin_id: &str) -> HostResult<Vec<PublishedVersion>> {
        let packages = self.packages.lock().unwrap_or_else(PoisonError::into_inner);
        packages
            .get(plugin_id)
            .map(|versions| versions.iter().map(|(p, _)| p.clone()).collect())
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))
    }

    async fn fetch_blob(&self, plugin_id: &str, version: &Version) -> HostResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let packages = self.packages.lock().unwrap_or_else(PoisonError::into_inner);
        packages
            .get(plugin_id)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|(p, _)| Version::parse(&p.version).is_ok_and(|v| &v == version))
            })
            .map(|(_, blob)| blob.clone())
            .ok_or_else(|| HostError::Registry(format!("no blob for {plugin_id}@{version}")))
    }
}
