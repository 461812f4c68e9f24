//! Core type definitions for PlugDock.
//!
//! This crate defines the small set of plugin-agnostic types shared by the
//! package format and the plugin host:
//! - Event and sandbox identifiers (UUID v7)
//! - Structured lifecycle events
//! - The plugin status state machine
//! - The weighted installation step sequence

mod event;
mod ids;
mod status;
mod step;

pub use event::{EventKind, PluginEvent};
pub use ids::{EventId, SandboxId};
pub use status::PluginStatus;
pub use step::InstallStep;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),
}
