//! Brokered capabilities handed to plugin hooks through a `SandboxContext`.
//!
//! Every call checks that the sandbox is still live and that the plugin was
//! granted the matching permission. Nothing here exposes a raw path, socket
//! or process handle.

use crate::error::{HostError, HostResult};
use crate::events::{EventBus, PluginSubscription};
use crate::permissions::Permission;
use crate::policy::{PolicyEngine, host_matches};
use crate::sandbox::SandboxShared;
use plugdock_types::{EventKind, PluginEvent};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_KEY_LEN: usize = 128;
const VALUE_SUFFIX: &str = ".json";

// ── Storage ─────────────────────────────────────────────────────

/// Namespaced key/value storage rooted at the plugin's own directory.
#[derive(Debug, Clone)]
pub struct StorageBroker {
    shared: Arc<SandboxShared>,
    root: PathBuf,
}

impl StorageBroker {
    pub(crate) fn new(shared: Arc<SandboxShared>, root: PathBuf) -> Self {
        Self { shared, root }
    }

    fn path_for(&self, key: &str) -> HostResult<PathBuf> {
        self.shared.ensure(Permission::Storage)?;
        validate_key(key)?;
        Ok(self.root.join(format!("{key}{VALUE_SUFFIX}")))
    }

    pub async fn get(&self, key: &str) -> HostResult<Option<Value>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostError::Storage(format!("read {key}: {e}"))),
        }
    }

    pub async fn set(&self, key: &str, value: &Value) -> HostResult<()> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec(value)?;
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| HostError::Storage(format!("create namespace: {e}")))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| HostError::Storage(format!("write {key}: {e}")))?;
        debug!(plugin_id = %self.shared.plugin_id, key = %key, "Stored value");
        Ok(())
    }

    /// Returns true if the key existed.
    pub async fn delete(&self, key: &str) -> HostResult<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HostError::Storage(format!("delete {key}: {e}"))),
        }
    }

    /// Every stored key, sorted.
    pub async fn keys(&self) -> HostResult<Vec<String>> {
        self.shared.ensure(Permission::Storage)?;
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HostError::Storage(format!("list: {e}"))),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| HostError::Storage(format!("list: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(key) = name.strip_suffix(VALUE_SUFFIX) {
                if validate_key(key).is_ok() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn validate_key(key: &str) -> HostResult<()> {
    let well_formed = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if well_formed {
        Ok(())
    } else {
        Err(HostError::Storage(format!("invalid storage key '{key}'")))
    }
}

// ── Network ─────────────────────────────────────────────────────

/// Outbound HTTP restricted to the manifest's `network_allow` hosts.
#[derive(Debug, Clone)]
pub struct NetworkBroker {
    shared: Arc<SandboxShared>,
    allow: Vec<String>,
    policy: Arc<PolicyEngine>,
    http: reqwest::Client,
}

impl NetworkBroker {
    pub(crate) fn new(
        shared: Arc<SandboxShared>,
        allow: Vec<String>,
        policy: Arc<PolicyEngine>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            shared,
            allow,
            policy,
            http,
        }
    }

    /// Reserves a connection slot for `url`.
    ///
    /// Refused when the sandbox is revoked or throttled, the permission is
    /// missing, the host is outside the allowlist or blocked by policy, or
    /// the connection ceiling is reached.
    pub fn open(&self, url: &str) -> HostResult<ConnectionGuard> {
        self.shared.ensure(Permission::Network)?;
        let plugin_id = &self.shared.plugin_id;

        let parsed = reqwest::Url::parse(url)
            .map_err(|e| HostError::Network(format!("invalid url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HostError::Network(format!("unsupported scheme '{}'", parsed.scheme())));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| HostError::Network(format!("url '{url}' has no host")))?;

        if self.policy.is_host_denied(host) {
            warn!(plugin_id = %plugin_id, host = %host, "Host blocked by policy");
            return Err(HostError::PolicyDenied(format!("host '{host}' is blocked")));
        }
        if !self.allow.iter().any(|pattern| host_matches(pattern, host)) {
            warn!(plugin_id = %plugin_id, host = %host, "Host not in network allowlist");
            return Err(HostError::PermissionDenied {
                plugin_id: plugin_id.clone(),
                permission: format!("network:{host}"),
            });
        }
        if self.shared.is_throttled() {
            return Err(HostError::ResourceLimitViolation {
                plugin_id: plugin_id.clone(),
                detail: "sandbox is throttled; new connections refused".into(),
            });
        }
        let max = self.shared.limits.max_connections;
        if !self.shared.usage.try_acquire_connection(max) {
            return Err(HostError::ResourceLimitViolation {
                plugin_id: plugin_id.clone(),
                detail: format!("connection limit of {max} reached"),
            });
        }

        debug!(plugin_id = %plugin_id, host = %host, "Connection opened");
        Ok(ConnectionGuard {
            shared: Arc::clone(&self.shared),
            url: parsed,
        })
    }

    /// Brokered GET; returns the response body.
    pub async fn fetch(&self, url: &str) -> HostResult<Vec<u8>> {
        let guard = self.open(url)?;
        let response = self
            .http
            .get(guard.url().clone())
            .send()
            .await
            .map_err(|e| HostError::Network(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HostError::Network(format!(
                "request to {url} returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| HostError::Network(format!("reading {url} failed: {e}")))?;
        drop(guard);
        Ok(body.to_vec())
    }

    pub fn active_connections(&self) -> u32 {
        self.shared.usage.connections()
    }
}

/// A reserved connection slot; released on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    shared: Arc<SandboxShared>,
    url: reqwest::Url,
}

impl ConnectionGuard {
    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.usage.release_connection();
    }
}

// ── Events ──────────────────────────────────────────────────────

/// The plugin's view of the event bus.
#[derive(Debug, Clone)]
pub struct PluginEventBus {
    shared: Arc<SandboxShared>,
    bus: EventBus,
}

impl PluginEventBus {
    pub(crate) fn new(shared: Arc<SandboxShared>, bus: EventBus) -> Self {
        Self { shared, bus }
    }

    /// Emits a `message` event tagged with this plugin's id.
    pub fn publish(&self, payload: Value) -> HostResult<()> {
        self.shared.ensure(Permission::Events)?;
        self.bus
            .emit(PluginEvent::new(EventKind::Message, self.shared.plugin_id.clone()).with_data(payload));
        Ok(())
    }

    /// Events concerning this plugin only.
    pub fn subscribe(&self) -> HostResult<PluginSubscription> {
        self.shared.ensure(Permission::Events)?;
        Ok(self.bus.subscribe_plugin(self.shared.plugin_id.clone()))
    }
}
