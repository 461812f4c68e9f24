//! Host configuration: reads `~/.plugdock/plugdock.toml` (or
//! `$PLUGDOCK_HOME/plugdock.toml`) and falls back to defaults.

use crate::sandbox::ResourceLimits;
use crate::validator::ValidationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "plugdock.toml";
pub const POLICY_FILE: &str = "policy.toml";

/// Runtime settings for the plugin host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Verified package blobs, keyed by `id@version`.
    pub cache_dir: PathBuf,
    /// Per-attempt extraction directories.
    pub work_dir: PathBuf,
    /// Root of every plugin's brokered key/value storage.
    pub storage_dir: PathBuf,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
    /// Resource sampling period for each live sandbox.
    pub monitor_interval_ms: u64,
    /// Rolling window in which repeated violations are counted.
    pub violation_window_secs: u64,
    /// Violations within the window that force deactivation.
    pub max_violations: u32,
    /// Default ceilings applied to every sandbox.
    pub limits: ResourceLimits,
    pub validation: ValidationConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::with_root(&home_path())
    }
}

impl HostConfig {
    /// Default settings with every directory rooted at `root`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            cache_dir: root.join("cache"),
            work_dir: root.join("work"),
            storage_dir: root.join("storage"),
            event_capacity: 1024,
            monitor_interval_ms: 1_000,
            violation_window_secs: 60,
            max_violations: 2,
            limits: ResourceLimits::default(),
            validation: ValidationConfig::default(),
        }
    }

    /// Loads `plugdock.toml` from the PlugDock home directory.
    pub fn load() -> Self {
        Self::load_from(home_path().join(CONFIG_FILE))
    }

    /// Loads settings from an explicit path.
    /// Falls back to defaults with a warning on read or parse errors.
    pub fn load_from(path: PathBuf) -> Self {
        if !path.exists() {
            info!("No host config found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<HostConfig>(&contents) {
                Ok(config) => {
                    info!("Loaded host config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse host config {:?}: {}. Using defaults.", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read host config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn violation_window(&self) -> Duration {
        Duration::from_secs(self.violation_window_secs)
    }
}

/// Resolve the PlugDock home directory.
pub fn home_path() -> PathBuf {
    if let Ok(dir) = std::env::var("PLUGDOCK_HOME") {
        PathBuf::from(dir)
    } else if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".plugdock")
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        Path::new(&home).join(".plugdock")
    } else {
        PathBuf::from(".plugdock")
    }
}
