//! Capability-based permission model for plugin sandboxes.
//!
//! Three tiers:
//! - Always granted: events (the plugin-scoped bus)
//! - Install-time reviewed: storage, network
//! - Never granted: filesystem, process (declaring them fails validation)
//!
//! Enterprise policy may strip install-time permissions; see [`crate::PolicyEngine`].

use plugdock_package::PkgPermission;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A capability a sandbox can broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    Events,
    Storage,
    Network,
}

impl Permission {
    pub fn tier(&self) -> PermissionTier {
        match self {
            Self::Events => PermissionTier::AlwaysGranted,
            Self::Storage | Self::Network => PermissionTier::InstallTime,
        }
    }

    /// The broker this permission gates.
    pub fn broker_name(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Storage => "storage",
            Self::Network => "network",
        }
    }

    /// Maps a manifest permission onto a brokered one.
    /// `filesystem` and `process` have no broker and map to `None`.
    pub fn from_manifest(permission: PkgPermission) -> Option<Self> {
        match permission {
            PkgPermission::Events => Some(Self::Events),
            PkgPermission::Storage => Some(Self::Storage),
            PkgPermission::Network => Some(Self::Network),
            PkgPermission::Filesystem | PkgPermission::Process => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.broker_name())
    }
}

/// Permission tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionTier {
    AlwaysGranted,
    InstallTime,
}

/// Set of permissions granted to a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    granted: HashSet<Permission>,
    /// Declared but withheld by policy.
    denied: HashSet<Permission>,
}

impl PermissionSet {
    /// Only always-granted permissions.
    pub fn baseline() -> Self {
        let mut set = Self::default();
        set.grant(Permission::Events);
        set
    }

    /// Baseline plus every brokered permission the manifest declares,
    /// minus any for which `is_denied` returns true.
    pub fn from_declared(
        declared: &[PkgPermission],
        is_denied: impl Fn(Permission) -> bool,
    ) -> Self {
        let mut set = Self::baseline();
        for permission in declared.iter().copied().filter_map(Permission::from_manifest) {
            if permission.tier() == PermissionTier::AlwaysGranted {
                continue;
            }
            if is_denied(permission) {
                set.deny(permission);
            } else {
                set.grant(permission);
            }
        }
        set
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    pub fn is_denied(&self, permission: Permission) -> bool {
        self.denied.contains(&permission)
    }

    pub fn grant(&mut self, permission: Permission) {
        self.denied.remove(&permission);
        self.granted.insert(permission);
    }

    pub fn deny(&mut self, permission: Permission) {
        self.granted.remove(&permission);
        self.denied.insert(permission);
    }

    pub fn granted_permissions(&self) -> &HashSet<Permission> {
        &self.granted
    }
}
