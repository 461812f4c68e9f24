//! Error types for the plugin host.

use crate::validator::ValidationReport;
use plugdock_package::{ConfigIssue, PkgError};
use plugdock_types::{InstallStep, PluginStatus};
use thiserror::Error;

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("plugin already installed: {0}")]
    PluginAlreadyInstalled(String),

    #[error("no published version of '{plugin_id}' matches '{range}'")]
    NoMatchingVersion { plugin_id: String, range: String },

    #[error("invalid version range '{range}': {reason}")]
    InvalidVersionRange { range: String, reason: String },

    #[error("checksum mismatch for {key}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("validation failed for '{}': {}", .0.plugin_id, .0.summary())]
    ValidationFailed(Box<ValidationReport>),

    #[error("dependency unsatisfied for '{plugin_id}': {reason}")]
    DependencyUnsatisfied { plugin_id: String, reason: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("installation already in progress: {0}")]
    InstallationAlreadyInProgress(String),

    #[error("resource limit exceeded: {plugin_id}: {detail}")]
    ResourceLimitViolation { plugin_id: String, detail: String },

    #[error("cannot remove '{plugin_id}': required by {}", .dependents.join(", "))]
    DependentPluginsExist {
        plugin_id: String,
        dependents: Vec<String>,
    },

    #[error("invalid configuration for '{plugin_id}': {}", format_issues(.issues))]
    ConfigurationInvalid {
        plugin_id: String,
        issues: Vec<ConfigIssue>,
    },

    #[error("plugin '{plugin_id}' cannot go from {from} to {to}")]
    InvalidStateTransition {
        plugin_id: String,
        from: PluginStatus,
        to: PluginStatus,
    },

    #[error("installation of '{plugin_id}' failed at step {step}: {source}")]
    InstallFailed {
        plugin_id: String,
        step: InstallStep,
        #[source]
        source: Box<HostError>,
    },

    #[error("step {requested} is behind current step {current} for '{plugin_id}'")]
    InvalidStepOrder {
        plugin_id: String,
        current: InstallStep,
        requested: InstallStep,
    },

    #[error("no installation in progress for '{0}'")]
    NoInstallationInProgress(String),

    #[error("permission denied: plugin '{plugin_id}' lacks '{permission}' capability")]
    PermissionDenied {
        plugin_id: String,
        permission: String,
    },

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("sandbox for '{0}' has been revoked")]
    SandboxRevoked(String),

    #[error("hook '{hook}' failed for '{plugin_id}': {message}")]
    Hook {
        plugin_id: String,
        hook: String,
        message: String,
    },

    #[error("timeout: plugin '{plugin_id}' exceeded {timeout_ms}ms deadline")]
    Timeout { plugin_id: String, timeout_ms: u64 },

    #[error("operation cancelled for '{0}'")]
    Cancelled(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("package error: {0}")]
    Package(#[from] PkgError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HostError {
    /// The underlying error of an `InstallFailed`, or `self`.
    pub fn root_cause(&self) -> &HostError {
        match self {
            HostError::InstallFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The installation step an error was raised at, if known.
    pub fn step(&self) -> Option<InstallStep> {
        match self {
            HostError::InstallFailed { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Integrity and resource violations are logged at error level wherever
    /// they are observed.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self.root_cause(),
            HostError::ChecksumMismatch { .. }
                | HostError::ResourceLimitViolation { .. }
                | HostError::PolicyDenied(_)
        ) || matches!(self.root_cause(), HostError::Package(PkgError::SignatureInvalid))
    }
}
