//! Shared fixtures for plugin host tests.

#![allow(dead_code)]

use plugdock_host::{
    HookRuntime, HostConfig, MemoryBlobCache, MemoryRegistry, PluginEvent, PluginManager,
    PolicyEngine, RecordingHookRuntime,
};
use plugdock_package::{Hook, PackageBuilder, PluginManifest};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Logs to the test writer when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn manifest(id: &str, version: &str) -> PluginManifest {
    PluginManifest {
        id: id.into(),
        name: format!("Plugin {id}"),
        version: version.into(),
        description: "Test plugin".into(),
        author: "Acme".into(),
        entry_point: "main.js".into(),
        hooks: vec![Hook::Initialize, Hook::Enable, Hook::Disable, Hook::Uninstall],
        ..Default::default()
    }
}

pub fn with_dependency(mut manifest: PluginManifest, id: &str, range: &str) -> PluginManifest {
    manifest.dependencies.insert(id.into(), range.into());
    manifest
}

/// A clean package: entry point plus the expected directories.
pub fn package(manifest: PluginManifest) -> Vec<u8> {
    PackageBuilder::new(manifest)
        .entry_point("export function initialize(ctx) { return ctx; }\n")
        .file("assets/icon.svg", "<svg/>")
        .file("locales/en.json", "{}")
        .build()
        .unwrap()
}

pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<MemoryRegistry>,
    pub cache: Arc<MemoryBlobCache>,
    pub manager: Arc<PluginManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {}, Arc::new(RecordingHookRuntime::new()), PolicyEngine::default())
    }

    pub fn with_hooks(hooks: Arc<dyn HookRuntime>) -> Self {
        Self::with(|_| {}, hooks, PolicyEngine::default())
    }

    pub fn with(
        configure: impl FnOnce(&mut HostConfig),
        hooks: Arc<dyn HookRuntime>,
        policy: PolicyEngine,
    ) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut config = HostConfig::with_root(dir.path());
        configure(&mut config);
        let registry = Arc::new(MemoryRegistry::new());
        let cache = Arc::new(MemoryBlobCache::new());
        let manager =
            PluginManager::new(config, registry.clone(), cache.clone(), hooks, policy).unwrap();
        Self {
            dir,
            registry,
            cache,
            manager,
        }
    }

    pub fn publish(&self, manifest: PluginManifest) {
        let id = manifest.id.clone();
        let version = manifest.version.clone();
        self.registry.publish(&id, &version, package(manifest));
    }
}

/// Every event already queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<PluginEvent>) -> Vec<PluginEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
