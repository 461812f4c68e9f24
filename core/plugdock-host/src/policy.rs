//! Enterprise policy engine: reads `~/.plugdock/policy.toml` and enforces
//! admin-managed plugin allowlists, permission overrides, signature
//! requirements, and network host blocks.

use crate::config::{POLICY_FILE, home_path};
use crate::permissions::Permission;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Enterprise policy mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Only explicitly listed plugins (or publishers) can be installed.
    Allowlist,
    /// All plugins except explicitly listed ones can be installed.
    Denylist,
    /// No restrictions on plugin installation.
    #[default]
    Unrestricted,
}

/// Policy configuration parsed from `policy.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: PolicyMode,
    #[serde(default)]
    pub allowed_plugin_ids: Vec<String>,
    /// Hex-encoded Ed25519 publisher keys.
    #[serde(default)]
    pub allowed_signing_keys: Vec<String>,
    #[serde(default)]
    pub denied_plugin_ids: Vec<String>,
    #[serde(default)]
    pub denied_permissions: HashSet<String>,
    /// Every package must carry a valid signature from an allowlisted key.
    #[serde(default)]
    pub require_signatures: bool,
    /// Host patterns no plugin may reach, regardless of its manifest.
    #[serde(default)]
    pub denied_hosts: Vec<String>,
}

/// Enforces enterprise policy decisions.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
    policy_path: Option<PathBuf>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::with_config(PolicyConfig::default())
    }
}

impl PolicyEngine {
    /// Loads policy from the PlugDock home directory if it exists.
    pub fn load() -> Self {
        Self::load_from(home_path().join(POLICY_FILE))
    }

    /// Loads policy from an explicit path.
    /// Falls back to unrestricted mode with a warning on parse errors.
    pub fn load_from(policy_path: PathBuf) -> Self {
        if !policy_path.exists() {
            info!("No policy file found at {:?}, running unrestricted", policy_path);
            return Self::default();
        }

        let config = match std::fs::read_to_string(&policy_path) {
            Ok(contents) => match toml::from_str::<PolicyFile>(&contents) {
                Ok(file) => {
                    info!("Loaded enterprise policy from {:?}", policy_path);
                    file.into_config()
                }
                Err(e) => {
                    warn!(
                        "Failed to parse policy file {:?}: {}. Falling back to unrestricted mode.",
                        policy_path, e
                    );
                    PolicyConfig::default()
                }
            },
            Err(e) => {
                warn!("Failed to read policy file {:?}: {}", policy_path, e);
                PolicyConfig::default()
            }
        };

        Self {
            config,
            policy_path: Some(policy_path),
        }
    }

    pub fn with_config(config: PolicyConfig) -> Self {
        Self {
            config,
            policy_path: None,
        }
    }

    /// Check if a plugin is allowed to be installed.
    pub fn is_plugin_allowed(&self, plugin_id: &str, signing_key: Option<&str>) -> bool {
        match self.config.mode {
            PolicyMode::Unrestricted => true,
            PolicyMode::Allowlist => {
                self.config.allowed_plugin_ids.iter().any(|id| id == plugin_id)
                    || signing_key.is_some_and(|k| self.is_signing_key_trusted(k))
            }
            PolicyMode::Denylist => !self.config.denied_plugin_ids.iter().any(|id| id == plugin_id),
        }
    }

    /// Keys compare case-insensitively since they are hex.
    pub fn is_signing_key_trusted(&self, key_hex: &str) -> bool {
        self.config
            .allowed_signing_keys
            .iter()
            .any(|k| k.eq_ignore_ascii_case(key_hex.trim()))
    }

    pub fn requires_signatures(&self) -> bool {
        self.config.require_signatures
    }

    /// Check if a permission is denied by enterprise policy.
    pub fn is_permission_denied_by_policy(&self, permission: Permission) -> bool {
        self.config.denied_permissions.contains(permission.broker_name())
    }

    /// Check if a host is blocked for every plugin.
    pub fn is_host_denied(&self, host: &str) -> bool {
        self.config.denied_hosts.iter().any(|pattern| host_matches(pattern, host))
    }

    /// Returns whether a policy file was found.
    pub fn has_policy_file(&self) -> bool {
        self.policy_path.is_some()
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}

/// Matches a host against `example.com` or `*.example.com`.
/// The wildcard covers subdomains only, not the apex.
pub(crate) fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{suffix}")),
        None => pattern == host,
    }
}

/// Raw TOML structure matching the policy.toml format.
#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policy: PolicySection,
}

#[derive(Deserialize, Default)]
struct PolicySection {
    #[serde(default)]
    mode: PolicyMode,
    #[serde(default)]
    require_signatures: bool,
    #[serde(default)]
    denied_hosts: Vec<String>,
    #[serde(default, rename = "allowed-plugins")]
    allowed_plugins: PluginList,
    #[serde(default, rename = "denied-plugins")]
    denied_plugins: PluginList,
    #[serde(default, rename = "denied-permissions")]
    denied_permissions: DeniedPermissions,
}

#[derive(Deserialize, Default)]
struct PluginList {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Deserialize, Default)]
struct DeniedPermissions {
    #[serde(default)]
    network: bool,
    #[serde(default)]
    storage: bool,
}

impl PolicyFile {
    fn into_config(self) -> PolicyConfig {
        let mut denied = HashSet::new();
        if self.policy.denied_permissions.network {
            denied.insert(Permission::Network.broker_name().to_string());
        }
        if self.policy.denied_permissions.storage {
            denied.insert(Permission::Storage.broker_name().to_string());
        }

        PolicyConfig {
            mode: self.policy.mode,
            allowed_plugin_ids: self.policy.allowed_plugins.ids,
            allowed_signing_keys: self.policy.allowed_plugins.keys,
            denied_plugin_ids: self.policy.denied_plugins.ids,
            denied_permissions: denied,
            require_signatures: self.policy.require_signatures,
            denied_hosts: self.policy.denied_hosts,
        }
    }
}
