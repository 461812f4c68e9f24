//! Plugin lifecycle host for PlugDock.
//!
//! Resolves a requested version range against a registry, downloads and
//! checksum-verifies the package, validates it statically, checks its
//! dependencies, and runs its hooks inside a capability-scoped sandbox
//! whose resource usage is supervised.
//!
//! [`PluginManager`] is the entry point; the other components are public
//! so hosts can embed or replace them individually.

mod broker;
mod cache;
mod config;
mod error;
mod events;
mod fetcher;
mod hooks;
mod manager;
mod permissions;
mod policy;
mod registry;
mod registry_client;
mod resolver;
mod sandbox;
mod tracker;
mod validator;

pub use broker::{ConnectionGuard, NetworkBroker, PluginEventBus, StorageBroker};
pub use cache::{BlobCache, FsBlobCache, MemoryBlobCache, cache_key};
pub use config::{CONFIG_FILE, HostConfig, POLICY_FILE, home_path};
pub use error::{HostError, HostResult};
pub use events::{EventBus, PluginSubscription};
pub use fetcher::{DownloadedPackage, PackageArtifact, PackageFetcher};
pub use hooks::{HookRuntime, NoopHookRuntime, RecordingHookRuntime};
pub use manager::{InstallRequest, PluginManager};
pub use permissions::{Permission, PermissionSet, PermissionTier};
pub use policy::{PolicyConfig, PolicyEngine, PolicyMode};
pub use registry::{PluginInfo, PluginRecord, PluginRegistry};
pub use registry_client::{
    HttpRegistryClient, HttpRegistryConfig, MemoryRegistry, PublishedVersion, RegistryClient,
};
pub use resolver::{ResolvedVersion, parse_range, resolve};
pub use sandbox::{
    ResourceKind, ResourceLimits, ResourceUsage, SandboxContext, SandboxHandle, SandboxMetrics,
    SandboxRuntime, UsageSnapshot, Violation,
};
pub use tracker::{InstallOutcome, InstallationState, InstallationTracker};
pub use validator::{
    Finding, FindingCategory, RiskLevel, Severity, StaticValidator, ValidationConfig,
    ValidationReport,
};

pub use plugdock_package::{ConfigMap, Hook, PluginManifest};
pub use plugdock_types::{EventKind, InstallStep, PluginEvent, PluginStatus, SandboxId};
