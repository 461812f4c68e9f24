//! Plugin manifest (`plugin.toml`) within a package.

use crate::schema::{ConfigMap, ConfigSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Top-level plugin manifest embedded in every package.
///
/// Identity fields default to empty strings so that an incomplete manifest
/// still parses and the validator can report every missing field at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier (e.g., "acme.weather").
    #[serde(default)]
    pub id: String,
    /// Human-readable plugin name.
    #[serde(default)]
    pub name: String,
    /// Semver version string.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Path of the entry file, relative to the package root.
    #[serde(default)]
    pub entry_point: String,
    /// Plugin id -> semver range.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Capabilities requested by this plugin.
    #[serde(default)]
    pub permissions: Vec<PkgPermission>,
    /// Host patterns the plugin may reach through the network broker.
    #[serde(default)]
    pub network_allow: Vec<String>,
    /// Well-known hooks this plugin implements.
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub config_schema: ConfigSchema,
    #[serde(default)]
    pub default_config: ConfigMap,
}

/// Capability a plugin can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkgPermission {
    /// Namespaced key/value storage.
    Storage,
    /// Brokered outbound network access.
    Network,
    /// Plugin-scoped event bus.
    Events,
    /// Direct host filesystem access. Never granted.
    Filesystem,
    /// Process control. Never granted.
    Process,
}

impl PkgPermission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Network => "network",
            Self::Events => "events",
            Self::Filesystem => "filesystem",
            Self::Process => "process",
        }
    }

    /// True for capabilities the host can broker.
    pub fn is_brokered(self) -> bool {
        matches!(self, Self::Storage | Self::Network | Self::Events)
    }
}

/// Lifecycle hook names the host knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    Initialize,
    Enable,
    Disable,
    Uninstall,
    Configure,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Uninstall => "uninstall",
            Self::Configure => "configure",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PluginManifest {
    /// Names of required identity fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("entry_point", &self.entry_point),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect()
    }

    /// Validates the manifest for required fields and constraints.
    pub fn validate(&self) -> Result<(), crate::PkgError> {
        if let Some(field) = self.missing_fields().first() {
            return Err(crate::PkgError::ManifestInvalid(format!("{field} is required")));
        }
        if self.dependencies.contains_key(&self.id) {
            return Err(crate::PkgError::ManifestInvalid(
                "a plugin cannot depend on itself".into(),
            ));
        }
        Ok(())
    }

    /// Parses a manifest from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, crate::PkgError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, crate::PkgError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn declares_hook(&self, hook: Hook) -> bool {
        self.hooks.contains(&hook)
    }

    pub fn requests(&self, permission: PkgPermission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Cache key for this manifest's artifact: `id@version`.
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }
}
