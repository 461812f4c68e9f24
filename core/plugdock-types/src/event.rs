//! Structured lifecycle events.
//!
//! Every lifecycle transition, installation progress update, and resource
//! violation is published as a `PluginEvent`. Consumers (audit log, UI)
//! decide persistence and alerting; the core only emits.

use crate::EventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstallStarted,
    Progress,
    Installed,
    Updated,
    Uninstalled,
    Enabled,
    Disabled,
    ConfigurationUpdated,
    Violation,
    Error,
    /// Emitted by a plugin through its scoped event bus.
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstallStarted => "install_started",
            Self::Progress => "progress",
            Self::Installed => "installed",
            Self::Updated => "updated",
            Self::Uninstalled => "uninstalled",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::ConfigurationUpdated => "configuration_updated",
            Self::Violation => "violation",
            Self::Error => "error",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable event, `{type, pluginId, timestamp, data?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub plugin_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginEvent {
    /// Creates an event stamped with the current time.
    pub fn new(kind: EventKind, plugin_id: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            kind,
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Serializes the event to a JSON string.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes an event from a JSON string.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
