//! The seam between the host and plugin code.
//!
//! Plugins never hand the host code to load. A host embeds one
//! [`HookRuntime`] per target language; the sandbox calls it only for the
//! hooks a manifest declares, passing a [`SandboxContext`] as the plugin's
//! entire view of the world.

use crate::sandbox::SandboxContext;
use async_trait::async_trait;
use plugdock_package::Hook;
use std::sync::{Mutex, PoisonError};

/// Executes a plugin's lifecycle hooks.
///
/// Errors are reported with `anyhow` since they originate in plugin code;
/// the sandbox converts them to [`crate::HostError::Hook`].
#[async_trait]
pub trait HookRuntime: Send + Sync {
    async fn call(&self, hook: Hook, ctx: &SandboxContext) -> anyhow::Result<()>;
}

/// Accepts every hook and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHookRuntime;

#[async_trait]
impl HookRuntime for NoopHookRuntime {
    async fn call(&self, _hook: Hook, _ctx: &SandboxContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records every call; useful when embedding the host in tests.
#[derive(Debug, Default)]
pub struct RecordingHookRuntime {
    calls: Mutex<Vec<(String, Hook)>>,
}

impl RecordingHookRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(plugin id, hook)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, Hook)> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_for(&self, plugin_id: &str) -> Vec<Hook> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == plugin_id)
            .map(|(_, hook)| hook)
            .collect()
    }
}

#[async_trait]
impl HookRuntime for RecordingHookRuntime {
    async fn call(&self, hook: Hook, ctx: &SandboxContext) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((ctx.plugin_id().to_string(), hook));
        Ok(())
    }
}
