//! Plugin lifecycle status and the transitions allowed between states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a plugin record.
///
/// ```text
/// not_installed --install--> installing --(ok)--> installed
/// installing --(fail)--> not_installed
/// installed --enable--> activating --(ok)--> active
/// activating --(fail)--> error
/// active --disable--> deactivating --(ok)--> installed
/// active --fatal violation--> error
/// installed | error --uninstall--> not_installed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    NotInstalled,
    Installing,
    /// Installed but not running (also the "disabled" state).
    Installed,
    Activating,
    /// Enabled with a live sandbox.
    Active,
    Deactivating,
    Error,
}

impl PluginStatus {
    /// Returns true if the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        matches!(
            (self, next),
            (NotInstalled, Installing)
                | (Installing, Installed)
                | (Installing, NotInstalled)
                | (Installed, Activating)
                | (Activating, Active)
                | (Activating, Error)
                | (Active, Deactivating)
                | (Active, Error)
                | (Deactivating, Installed)
                | (Deactivating, Error)
                | (Installed, NotInstalled)
                | (Error, NotInstalled)
        )
    }

    /// True for the only status in which a plugin owns a live sandbox.
    pub fn has_sandbox(self) -> bool {
        self == PluginStatus::Active
    }

    /// Snake-case name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_path_allowed() {
        assert!(PluginStatus::NotInstalled.can_transition_to(PluginStatus::Installing));
        assert!(PluginStatus::Installing.can_transition_to(PluginStatus::Installed));
        assert!(PluginStatus::Installing.can_transition_to(PluginStatus::NotInstalled));
    }

    #[test]
    fn active_cannot_be_uninstalled_directly() {
        assert!(!PluginStatus::Active.can_transition_to(PluginStatus::NotInstalled));
        assert!(!PluginStatus::Installed.can_transition_to(PluginStatus::Active));
    }

    #[test]
    fn only_active_owns_sandbox() {
        assert!(PluginStatus::Active.has_sandbox());
        assert!(!PluginStatus::Activating.has_sandbox());
        assert!(!PluginStatus::Error.has_sandbox());
    }
}
