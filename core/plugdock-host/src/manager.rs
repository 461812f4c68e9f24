//! Central plugin lifecycle manager.
//!
//! Composes resolution, fetching, validation, sandboxing, tracking and the
//! registry into the public lifecycle operations. Operations on one plugin
//! id are serialized; different ids proceed concurrently.
//!
//! A supervisor task consumes sandbox violations and escalates: the first
//! violation in the window throttles the sandbox, `max_violations` within
//! the window destroys it and puts the plugin into `error`.

use crate::cache::{BlobCache, FsBlobCache};
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::events::{EventBus, PluginSubscription};
use crate::fetcher::PackageFetcher;
use crate::hooks::HookRuntime;
use crate::policy::PolicyEngine;
use crate::registry::{PluginInfo, PluginRecord, PluginRegistry};
use crate::registry_client::RegistryClient;
use crate::resolver::{ResolvedVersion, resolve};
use crate::sandbox::{SandboxMetrics, SandboxRuntime, Violation};
use crate::tracker::{InstallationState, InstallationTracker};
use crate::validator::{StaticValidator, ValidationReport};
use plugdock_package::{ConfigMap, Hook, PluginManifest, PluginPackage, VerifyingKey};
use plugdock_types::{EventKind, InstallStep, PluginEvent, PluginStatus};
use semver::Version;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{OwnedMutexGuard, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Parameters of an installation.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub plugin_id: String,
    /// Semver range; the newest stable version when absent.
    pub range: Option<String>,
    /// Configuration overrides.
    pub config: Option<ConfigMap>,
    /// Cancels the installation between steps and during download.
    pub cancel: CancellationToken,
}

impl InstallRequest {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    #[must_use]
    pub fn config(mut self, config: ConfigMap) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

type PluginMutex = Arc<tokio::sync::Mutex<()>>;

/// Exclusive use of one plugin id. The map entry is dropped with the last
/// holder or waiter.
struct PluginLock<'a> {
    locks: &'a Mutex<HashMap<String, PluginMutex>>,
    plugin_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PluginLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.plugin_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.plugin_id);
        }
    }
}

/// Everything the first five install steps produce.
struct StagedPackage {
    manifest: PluginManifest,
    version: Version,
    checksum: String,
    extraction_path: PathBuf,
    config: ConfigMap,
    overrides: ConfigMap,
    report: ValidationReport,
}

/// Partial state to undo if an installation fails.
#[derive(Default)]
struct Rollback {
    extraction_path: Option<PathBuf>,
    registered: bool,
}

pub struct PluginManager {
    config: HostConfig,
    registry: PluginRegistry,
    tracker: InstallationTracker,
    fetcher: PackageFetcher,
    validator: StaticValidator,
    sandboxes: SandboxRuntime,
    policy: Arc<PolicyEngine>,
    events: EventBus,
    locks: Mutex<HashMap<String, PluginMutex>>,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
    violations: Mutex<HashMap<String, VecDeque<Instant>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PluginManager {
    /// Builds a manager and starts its violation supervisor.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: HostConfig,
        registry_client: Arc<dyn RegistryClient>,
        cache: Arc<dyn BlobCache>,
        hooks: Arc<dyn HookRuntime>,
        policy: PolicyEngine,
    ) -> HostResult<Arc<Self>> {
        let policy = Arc::new(policy);
        let events = EventBus::new(config.event_capacity);
        let (sandboxes, violation_rx) =
            SandboxRuntime::new(&config, hooks, Arc::clone(&policy), events.clone())?;

        let manager = Arc::new(Self {
            registry: PluginRegistry::new(),
            tracker: InstallationTracker::new(events.clone()),
            fetcher: PackageFetcher::new(registry_client, cache, config.work_dir.clone()),
            validator: StaticValidator::new(config.validation.clone()),
            sandboxes,
            policy,
            events,
            locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
            violations: Mutex::new(HashMap::new()),
            supervisor: Mutex::new(None),
            config,
        });

        let supervisor = tokio::spawn(supervise(Arc::downgrade(&manager), violation_rx));
        *manager.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        if manager.policy.has_policy_file() {
            info!(mode = ?manager.policy.config().mode, "Enterprise plugin policy in effect");
        }
        Ok(manager)
    }

    /// A manager with a filesystem cache under `config.cache_dir` and the
    /// policy file from the PlugDock home directory.
    pub fn from_config(
        config: HostConfig,
        registry_client: Arc<dyn RegistryClient>,
        hooks: Arc<dyn HookRuntime>,
    ) -> HostResult<Arc<Self>> {
        let cache = Arc::new(FsBlobCache::new(config.cache_dir.clone()));
        Self::new(config, registry_client, cache, hooks, PolicyEngine::load())
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    // ================================================================
    // Installation
    // ================================================================

    pub async fn install(
        &self,
        plugin_id: &str,
        range: Option<&str>,
        config: Option<ConfigMap>,
    ) -> HostResult<PluginInfo> {
        let mut request = InstallRequest::new(plugin_id);
        request.range = range.map(str::to_string);
        request.config = config;
        self.install_with(request).await
    }

    /// Resolves, downloads, validates, extracts, checks dependencies,
    /// configures, registers and initializes a plugin, in that order.
    ///
    /// On failure every partial change is undone (the cached blob is kept)
    /// and the error names the step it happened at.
    pub async fn install_with(&self, request: InstallRequest) -> HostResult<PluginInfo> {
        let plugin_id = request.plugin_id.clone();
        self.ensure_not_installing(&plugin_id)?;
        let _lock = self.lock_plugin(&plugin_id).await;

        if self.registry.contains(&plugin_id) {
            return Err(HostError::PluginAlreadyInstalled(plugin_id));
        }
        self.tracker.start(&plugin_id)?;
        self.track_cancellation(&plugin_id, &request.cancel);

        let mut rollback = Rollback::default();
        let result = self.run_install(&request, &mut rollback).await;
        self.untrack_cancellation(&plugin_id);

        match result {
            Ok(info) => {
                self.tracker.complete(&plugin_id)?;
                self.events.emit(
                    PluginEvent::new(EventKind::Installed, &plugin_id)
                        .with_data(json!({ "version": info.version })),
                );
                info!(plugin_id = %plugin_id, version = %info.version, "Plugin installed");
                Ok(info)
            }
            Err(e) => Err(self.fail_installation(&plugin_id, e, rollback).await),
        }
    }

    async fn run_install(&self, request: &InstallRequest, rollback: &mut Rollback) -> HostResult<PluginInfo> {
        let plugin_id = &request.plugin_id;
        self.checkpoint(plugin_id, InstallStep::Download, &request.cancel)?;
        let resolved = self.resolve(plugin_id, request.range.as_deref()).await?;
        let overrides = request.config.clone().unwrap_or_default();
        let staged = self
            .stage(plugin_id, &resolved, overrides, false, &request.cancel, rollback)
            .await?;

        // Install
        self.checkpoint(plugin_id, InstallStep::Install, &request.cancel)?;
        let record = PluginRecord::new(
            staged.manifest.clone(),
            staged.version.clone(),
            staged.checksum.clone(),
            staged.extraction_path.clone(),
            staged.config.clone(),
            staged.overrides.clone(),
        );
        self.registry.register(record)?;
        rollback.registered = true;
        self.tracker.advance(plugin_id, InstallStep::Install, 1.0)?;

        // Initialize
        self.checkpoint(plugin_id, InstallStep::Initialize, &request.cancel)?;
        self.run_transient_hook(&staged.manifest, staged.config, &staged.extraction_path, Hook::Initialize)
            .await?;
        self.registry.transition(plugin_id, PluginStatus::Installed)?;
        self.tracker.advance(plugin_id, InstallStep::Initialize, 1.0)?;

        debug!(
            plugin_id = %plugin_id,
            security_score = staged.report.security_score,
            maintainability_score = staged.report.maintainability_score,
            warnings = staged.report.warnings().count(),
            "Validation summary"
        );
        self.registry
            .get(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.clone()))
    }

    /// Download (already begun) through configure. Nothing is registered.
    ///
    /// With `migrate`, override keys the new schema does not declare are
    /// dropped instead of failing validation.
    async fn stage(
        &self,
        plugin_id: &str,
        resolved: &ResolvedVersion,
        mut overrides: ConfigMap,
        migrate: bool,
        cancel: &CancellationToken,
        rollback: &mut Rollback,
    ) -> HostResult<StagedPackage> {
        // Download
        self.check_policy(plugin_id, resolved)?;
        let download = self.fetcher.download(plugin_id, resolved, cancel).await?;
        self.tracker.advance(plugin_id, InstallStep::Download, 1.0)?;

        // Validate
        self.checkpoint(plugin_id, InstallStep::Validate, cancel)?;
        let package = PluginPackage::from_bytes(&download.bytes)?;
        check_identity(plugin_id, &resolved.version, &package.manifest)?;
        self.check_signature(plugin_id, resolved, &package)?;
        let report = self.validator.validate_package(&package).await?.into_result()?;
        self.tracker.advance(plugin_id, InstallStep::Validate, 1.0)?;

        // Extract
        self.checkpoint(plugin_id, InstallStep::Extract, cancel)?;
        let extraction_path = self.fetcher.extract(plugin_id, &resolved.version, &package).await?;
        rollback.extraction_path = Some(extraction_path.clone());
        self.tracker.advance(plugin_id, InstallStep::Extract, 1.0)?;

        // Dependencies
        self.checkpoint(plugin_id, InstallStep::Dependencies, cancel)?;
        let manifest = package.manifest;
        self.registry.check_install_dependencies(&manifest)?;
        self.tracker.advance(plugin_id, InstallStep::Dependencies, 1.0)?;

        // Configure
        self.checkpoint(plugin_id, InstallStep::Configure, cancel)?;
        if migrate && !manifest.config_schema.is_empty() {
            overrides.retain(|key, _| {
                let known = manifest.config_schema.get(key).is_some();
                if !known {
                    warn!(plugin_id = %plugin_id, key = %key, "Dropping configuration key unknown to new version");
                }
                known
            });
        }
        let config = manifest
            .config_schema
            .resolve(&manifest.default_config, &overrides)
            .map_err(|issues| HostError::ConfigurationInvalid {
                plugin_id: plugin_id.to_string(),
                issues,
            })?;
        self.tracker.advance(plugin_id, InstallStep::Configure, 1.0)?;

        Ok(StagedPackage {
            manifest,
            version: resolved.version.clone(),
            checksum: download.checksum,
            extraction_path,
            config,
            overrides,
            report,
        })
    }

    async fn resolve(&self, plugin_id: &str, range: Option<&str>) -> HostResult<ResolvedVersion> {
        let published = self.fetcher.registry().list_versions(plugin_id).await?;
        let resolved = resolve(plugin_id, range, &published)?;
        info!(plugin_id = %plugin_id, version = %resolved.version, "Resolved version");
        Ok(resolved)
    }

    fn check_policy(&self, plugin_id: &str, resolved: &ResolvedVersion) -> HostResult<()> {
        if !self.policy.is_plugin_allowed(plugin_id, resolved.signing_key.as_deref()) {
            error!(plugin_id = %plugin_id, "Plugin blocked by policy");
            return Err(HostError::PolicyDenied(format!("plugin '{plugin_id}' blocked by policy")));
        }
        Ok(())
    }

    fn check_signature(&self, plugin_id: &str, resolved: &ResolvedVersion, package: &PluginPackage) -> HostResult<()> {
        if !self.policy.requires_signatures() {
            return Ok(());
        }
        let key_hex = resolved.signing_key.as_deref().ok_or_else(|| {
            HostError::PolicyDenied(format!("plugin '{plugin_id}' has no publisher key and policy requires signatures"))
        })?;
        if !self.policy.is_signing_key_trusted(key_hex) {
            return Err(HostError::PolicyDenied(format!(
                "publisher key of '{plugin_id}' is not trusted"
            )));
        }
        package.verify(&VerifyingKey::from_hex(key_hex)?)?;
        debug!(plugin_id = %plugin_id, "Package signature verified");
        Ok(())
    }

    /// Records the failure, undoes partial state and wraps the error with
    /// the step it happened at.
    async fn fail_installation(&self, plugin_id: &str, err: HostError, rollback: Rollback) -> HostError {
        let step = self
            .tracker
            .fail(plugin_id, &err)
            .ok()
            .and_then(|state| state.failed_step)
            .unwrap_or(InstallStep::Download);

        if self.registry.sandbox_id(plugin_id).is_none() {
            self.sandboxes.destroy_sandbox(plugin_id);
        }
        if rollback.registered {
            if let Err(e) = self.registry.transition(plugin_id, PluginStatus::NotInstalled) {
                warn!(plugin_id = %plugin_id, "Rollback transition failed: {e}");
            }
            let _ = self.registry.unregister(plugin_id);
        }
        if let Some(path) = &rollback.extraction_path {
            self.fetcher.discard_extraction(path).await;
        }

        if err.is_security_relevant() {
            error!(plugin_id = %plugin_id, step = ?step, "Installation refused: {err}");
        } else {
            warn!(plugin_id = %plugin_id, step = ?step, "Installation failed: {err}");
        }
        self.events.emit(
            PluginEvent::new(EventKind::Error, plugin_id)
                .with_data(failure_data(step, &err))
                .with_error(err.to_string()),
        );

        HostError::InstallFailed {
            plugin_id: plugin_id.to_string(),
            step,
            source: Box::new(err),
        }
    }

    /// Cancels an in-flight installation or update. Returns false if none.
    pub fn cancel_installation(&self, plugin_id: &str) -> bool {
        match self
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
        {
            Some(token) => {
                info!(plugin_id = %plugin_id, "Cancelling installation");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Installs and updates of one plugin do not queue behind each other.
    fn ensure_not_installing(&self, plugin_id: &str) -> HostResult<()> {
        if self.tracker.is_in_flight(plugin_id) {
            debug!(plugin_id = %plugin_id, "Rejecting concurrent installation");
            return Err(HostError::InstallationAlreadyInProgress(plugin_id.to_string()));
        }
        Ok(())
    }

    /// Marks `step` as begun, unless the installation was cancelled.
    fn checkpoint(&self, plugin_id: &str, step: InstallStep, cancel: &CancellationToken) -> HostResult<()> {
        self.tracker.advance(plugin_id, step, 0.0)?;
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled(plugin_id.to_string()));
        }
        Ok(())
    }

    fn track_cancellation(&self, plugin_id: &str, token: &CancellationToken) {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.to_string(), token.clone());
    }

    fn untrack_cancellation(&self, plugin_id: &str) {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id);
    }

    // ================================================================
    // Update
    // ================================================================

    /// Moves an installed plugin to the newest version matching `range`.
    ///
    /// Runs the full install pipeline for the new version, carries the
    /// configuration overrides across (keys the new schema does not know are
    /// dropped) and re-enables the plugin if it was active.
    pub async fn update(&self, plugin_id: &str, range: Option<&str>) -> HostResult<PluginInfo> {
        self.ensure_not_installing(plugin_id)?;
        let _lock = self.lock_plugin(plugin_id).await;

        let (status, current, overrides) = self
            .registry
            .with_record(plugin_id, |r| (r.status, r.version.clone(), r.overrides.clone()))
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        if !matches!(status, PluginStatus::Installed | PluginStatus::Active) {
            return Err(HostError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: status,
                to: PluginStatus::Installing,
            });
        }

        let target = self.resolve(plugin_id, range).await?;
        if target.version == current {
            info!(plugin_id = %plugin_id, version = %current, "Already at resolved version");
            return self
                .registry
                .get(plugin_id)
                .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()));
        }

        self.tracker.start(plugin_id)?;
        let cancel = CancellationToken::new();
        self.track_cancellation(plugin_id, &cancel);
        let was_active = status == PluginStatus::Active;

        let mut rollback = Rollback::default();
        let result = self
            .run_update(plugin_id, &target, overrides, was_active, &cancel, &mut rollback)
            .await;
        self.untrack_cancellation(plugin_id);

        let info = match result {
            Ok(info) => info,
            Err(e) => {
                // The previous record is untouched; bring it back up if needed.
                let e = self.fail_installation(plugin_id, e, rollback).await;
                if was_active && self.registry.status(plugin_id) == Some(PluginStatus::Installed) {
                    if let Err(re) = self.enable_locked(plugin_id).await {
                        warn!(plugin_id = %plugin_id, "Could not re-enable previous version: {re}");
                    }
                }
                return Err(e);
            }
        };

        self.tracker.complete(plugin_id)?;
        self.events.emit(
            PluginEvent::new(EventKind::Updated, plugin_id)
                .with_data(json!({ "from": current.to_string(), "to": info.version })),
        );
        info!(plugin_id = %plugin_id, from = %current, to = %info.version, "Plugin updated");

        if was_active {
            self.enable_locked(plugin_id).await?;
            return self
                .registry
                .get(plugin_id)
                .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()));
        }
        Ok(info)
    }

    async fn run_update(
        &self,
        plugin_id: &str,
        target: &ResolvedVersion,
        overrides: ConfigMap,
        was_active: bool,
        cancel: &CancellationToken,
        rollback: &mut Rollback,
    ) -> HostResult<PluginInfo> {
        self.checkpoint(plugin_id, InstallStep::Download, cancel)?;
        let staged = self.stage(plugin_id, target, overrides, true, cancel, rollback).await?;

        // Install
        self.checkpoint(plugin_id, InstallStep::Install, cancel)?;
        if was_active {
            self.disable_locked(plugin_id).await?;
        }
        self.tracker.advance(plugin_id, InstallStep::Install, 1.0)?;

        // Initialize
        self.checkpoint(plugin_id, InstallStep::Initialize, cancel)?;
        self.run_transient_hook(
            &staged.manifest,
            staged.config.clone(),
            &staged.extraction_path,
            Hook::Initialize,
        )
        .await?;

        let mut record = PluginRecord::new(
            staged.manifest,
            staged.version,
            staged.checksum,
            staged.extraction_path,
            staged.config,
            staged.overrides,
        );
        record.status = PluginStatus::Installed;
        let previous = self.registry.replace(record)?;
        self.tracker.advance(plugin_id, InstallStep::Initialize, 1.0)?;
        self.fetcher.discard_extraction(&previous.extraction_path).await;

        self.registry
            .get(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))
    }

    // ================================================================
    // Uninstall
    // ================================================================

    /// Runs the uninstall hook, tears down any sandbox and removes the
    /// plugin. Refused while other plugins depend on it, unless `force`.
    pub async fn uninstall(&self, plugin_id: &str, force: bool) -> HostResult<()> {
        let _lock = self.lock_plugin(plugin_id).await;

        let status = self
            .registry
            .status(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;

        let dependents = self.registry.dependents_of(plugin_id);
        if !dependents.is_empty() {
            if !force {
                let err = HostError::DependentPluginsExist {
                    plugin_id: plugin_id.to_string(),
                    dependents,
                };
                warn!(plugin_id = %plugin_id, "Uninstall refused: {err}");
                self.emit_refusal(plugin_id, "uninstall", &err);
                return Err(err);
            }
            warn!(plugin_id = %plugin_id, dependents = ?dependents, "Force-uninstalling a plugin others depend on");
        }

        match status {
            PluginStatus::Active => {
                let handle = self.registry.deactivate(plugin_id, PluginStatus::Deactivating)?;
                if let Some(handle) = handle {
                    if let Err(e) = self.sandboxes.run_hook(handle.context(), Hook::Uninstall).await {
                        warn!(plugin_id = %plugin_id, "Uninstall hook failed: {e}");
                    }
                }
                self.sandboxes.destroy_sandbox(plugin_id);
                self.registry.transition(plugin_id, PluginStatus::Installed)?;
            }
            PluginStatus::Installed | PluginStatus::Error => {
                let (manifest, config, path) = self.launch_params(plugin_id)?;
                if let Err(e) = self.run_transient_hook(&manifest, config, &path, Hook::Uninstall).await {
                    warn!(plugin_id = %plugin_id, "Uninstall hook failed: {e}");
                }
            }
            other => {
                return Err(HostError::InvalidStateTransition {
                    plugin_id: plugin_id.to_string(),
                    from: other,
                    to: PluginStatus::NotInstalled,
                });
            }
        }

        self.registry.transition(plugin_id, PluginStatus::NotInstalled)?;
        let record = self.registry.unregister(plugin_id)?;
        self.fetcher.discard_extraction(&record.extraction_path).await;
        self.clear_violations(plugin_id);

        self.events.emit(
            PluginEvent::new(EventKind::Uninstalled, plugin_id)
                .with_data(json!({ "version": record.version.to_string(), "forced": force && !dependents.is_empty() })),
        );
        info!(plugin_id = %plugin_id, version = %record.version, "Plugin uninstalled");
        Ok(())
    }

    // ================================================================
    // Enable / Disable
    // ================================================================

    /// Validates dependencies, creates the sandbox and runs the enable hook.
    pub async fn enable(&self, plugin_id: &str) -> HostResult<PluginInfo> {
        let _lock = self.lock_plugin(plugin_id).await;
        self.enable_locked(plugin_id).await?;
        self.registry
            .get(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))
    }

    async fn enable_locked(&self, plugin_id: &str) -> HostResult<()> {
        let status = self
            .registry
            .status(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        if !status.can_transition_to(PluginStatus::Activating) {
            return Err(HostError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: status,
                to: PluginStatus::Activating,
            });
        }
        if let Err(e) = self.registry.validate_dependencies(plugin_id) {
            warn!(plugin_id = %plugin_id, "Activation refused: {e}");
            self.emit_refusal(plugin_id, "enable", &e);
            return Err(e);
        }

        let (manifest, config, path) = self.launch_params(plugin_id)?;
        self.registry.transition(plugin_id, PluginStatus::Activating)?;
        let handle = self
            .sandboxes
            .create_sandbox(&manifest, self.config.limits, config, &path);

        if let Err(e) = self.sandboxes.run_hook(handle.context(), Hook::Enable).await {
            self.sandboxes.destroy_sandbox(plugin_id);
            self.registry.transition(plugin_id, PluginStatus::Error)?;
            self.registry.set_error(plugin_id, e.to_string());
            error!(plugin_id = %plugin_id, "Activation failed: {e}");
            self.events.emit(
                PluginEvent::new(EventKind::Error, plugin_id)
                    .with_data(json!({ "operation": "enable" }))
                    .with_error(e.to_string()),
            );
            return Err(e);
        }

        let sandbox_id = handle.id();
        self.registry.activate(plugin_id, handle)?;
        self.events.emit(
            PluginEvent::new(EventKind::Enabled, plugin_id)
                .with_data(json!({ "sandbox_id": sandbox_id.to_string() })),
        );
        info!(plugin_id = %plugin_id, sandbox_id = %sandbox_id, "Plugin enabled");
        Ok(())
    }

    /// Runs the disable hook and destroys the sandbox.
    pub async fn disable(&self, plugin_id: &str) -> HostResult<PluginInfo> {
        let _lock = self.lock_plugin(plugin_id).await;
        self.disable_locked(plugin_id).await?;
        self.registry
            .get(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))
    }

    async fn disable_locked(&self, plugin_id: &str) -> HostResult<()> {
        let handle = self.registry.deactivate(plugin_id, PluginStatus::Deactivating)?;
        if let Some(handle) = handle {
            if let Err(e) = self.sandboxes.run_hook(handle.context(), Hook::Disable).await {
                warn!(plugin_id = %plugin_id, "Disable hook failed: {e}");
            }
        }
        self.sandboxes.destroy_sandbox(plugin_id);
        self.registry.transition(plugin_id, PluginStatus::Installed)?;
        self.clear_violations(plugin_id);

        self.events.emit(PluginEvent::new(EventKind::Disabled, plugin_id));
        info!(plugin_id = %plugin_id, "Plugin disabled");
        Ok(())
    }

    // ================================================================
    // Configuration
    // ================================================================

    /// Merges `partial` into the plugin's configuration. Nothing changes if
    /// the result fails schema validation. An active plugin that declares
    /// the configure hook is notified; a failing hook is reported as an
    /// `error` event but does not undo the change.
    pub async fn update_configuration(&self, plugin_id: &str, partial: ConfigMap) -> HostResult<ConfigMap> {
        let _lock = self.lock_plugin(plugin_id).await;

        let config = match self.registry.update_configuration(plugin_id, &partial) {
            Ok(config) => config,
            Err(e) => {
                warn!(plugin_id = %plugin_id, "Configuration rejected: {e}");
                if let HostError::ConfigurationInvalid { issues, .. } = &e {
                    self.events.emit(
                        PluginEvent::new(EventKind::Error, plugin_id)
                            .with_data(json!({ "operation": "update_configuration", "issues": issues }))
                            .with_error(e.to_string()),
                    );
                }
                return Err(e);
            }
        };

        self.events.emit(
            PluginEvent::new(EventKind::ConfigurationUpdated, plugin_id)
                .with_data(json!({ "config": config })),
        );
        info!(plugin_id = %plugin_id, "Configuration updated");

        if let Some(context) = self.registry.sandbox_context(plugin_id) {
            if let Err(e) = self.sandboxes.run_hook(&context, Hook::Configure).await {
                warn!(plugin_id = %plugin_id, "Configure hook failed: {e}");
                self.events.emit(
                    PluginEvent::new(EventKind::Error, plugin_id)
                        .with_data(json!({ "operation": "configure", "applied": true }))
                        .with_error(e.to_string()),
                );
            }
        }
        Ok(config)
    }

    // ================================================================
    // Queries
    // ================================================================

    pub fn get_all_plugins(&self) -> Vec<PluginInfo> {
        self.registry.get_all()
    }

    pub fn get_plugin(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.registry.get(plugin_id)
    }

    /// Registry status, `installing` while an installation is in flight,
    /// otherwise `not_installed`.
    pub fn get_plugin_status(&self, plugin_id: &str) -> PluginStatus {
        match self.registry.status(plugin_id) {
            Some(status) => status,
            None if self.tracker.is_in_flight(plugin_id) => PluginStatus::Installing,
            None => PluginStatus::NotInstalled,
        }
    }

    /// The manifest of an installed plugin.
    pub fn get_plugin_metadata(&self, plugin_id: &str) -> Option<Arc<PluginManifest>> {
        self.registry.manifest(plugin_id)
    }

    /// Resource usage of an active plugin's sandbox.
    pub fn get_plugin_metrics(&self, plugin_id: &str) -> Option<SandboxMetrics> {
        self.registry.metrics(plugin_id)
    }

    pub fn installation_status(&self, plugin_id: &str) -> Option<InstallationState> {
        self.tracker.status(plugin_id)
    }

    pub fn installation_history(&self, plugin_id: &str) -> Vec<InstallationState> {
        self.tracker.history(plugin_id)
    }

    /// Every lifecycle event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_plugin(&self, plugin_id: &str) -> PluginSubscription {
        self.events.subscribe_plugin(plugin_id)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ================================================================
    // Supervision
    // ================================================================

    async fn handle_violation(&self, violation: Violation) {
        let plugin_id = violation.plugin_id.clone();
        if !self.sandboxes.is_live(&plugin_id, violation.sandbox_id) {
            debug!(plugin_id = %plugin_id, sandbox_id = %violation.sandbox_id, "Discarding violation from stale sandbox");
            return;
        }
        // Install, update and uninstall hooks run in short-lived sandboxes
        // that are torn down as soon as the hook returns.
        let supervised = matches!(
            self.registry.status(&plugin_id),
            Some(PluginStatus::Activating | PluginStatus::Active | PluginStatus::Deactivating)
        );
        if !supervised {
            warn!(
                plugin_id = %plugin_id,
                resource = %violation.resource,
                observed = violation.observed,
                limit = violation.limit,
                "Violation in a transient sandbox, not escalated"
            );
            return;
        }

        let count = self.record_violation(&plugin_id);
        error!(
            plugin_id = %plugin_id,
            resource = %violation.resource,
            observed = violation.observed,
            limit = violation.limit,
            count,
            "Sandbox violation"
        );
        self.events.emit(
            PluginEvent::new(EventKind::Violation, &plugin_id).with_data(json!({
                "sandbox_id": violation.sandbox_id.to_string(),
                "resource": violation.resource,
                "observed": violation.observed,
                "limit": violation.limit,
                "count": count,
            })),
        );

        if count < self.config.max_violations as usize {
            if self.sandboxes.throttle(&plugin_id, violation.sandbox_id) {
                warn!(plugin_id = %plugin_id, "Sandbox throttled");
            }
            return;
        }

        // An activation in progress holds the lock until its enable hook
        // returns; the sandbox is registered by then or already gone.
        let _lock = self.lock_plugin(&plugin_id).await;
        if self.registry.sandbox_id(&plugin_id) != Some(violation.sandbox_id) {
            debug!(plugin_id = %plugin_id, "Sandbox went away before escalation");
            return;
        }

        let err = HostError::ResourceLimitViolation {
            plugin_id: plugin_id.clone(),
            detail: format!("{} ({count} violations within the window)", violation.describe()),
        };
        match self.registry.deactivate(&plugin_id, PluginStatus::Error) {
            Ok(_) => {
                self.sandboxes.destroy_sandbox(&plugin_id);
                self.registry.set_error(&plugin_id, err.to_string());
                self.clear_violations(&plugin_id);
                error!(plugin_id = %plugin_id, "Plugin deactivated after repeated violations");
                self.events.emit(
                    PluginEvent::new(EventKind::Error, &plugin_id)
                        .with_data(json!({ "operation": "supervision", "resource": violation.resource }))
                        .with_error(err.to_string()),
                );
            }
            Err(e) => warn!(plugin_id = %plugin_id, "Could not deactivate after violations: {e}"),
        }
    }

    /// Adds a violation to the plugin's rolling window; returns the count
    /// within the window.
    fn record_violation(&self, plugin_id: &str) -> usize {
        let now = Instant::now();
        let window = self.config.violation_window();
        let mut violations = self.violations.lock().unwrap_or_else(PoisonError::into_inner);
        let recent = violations.entry(plugin_id.to_string()).or_default();
        while recent.front().is_some_and(|at| now.duration_since(*at) > window) {
            recent.pop_front();
        }
        recent.push_back(now);
        recent.len()
    }

    fn clear_violations(&self, plugin_id: &str) {
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id);
    }

    // ================================================================
    // Helpers
    // ================================================================

    /// Waits for exclusive use of `plugin_id`.
    async fn lock_plugin(&self, plugin_id: &str) -> PluginLock<'_> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(plugin_id.to_string())
                .or_default(),
        );
        PluginLock {
            locks: &self.locks,
            plugin_id: plugin_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Announces an operation refused before it changed anything.
    fn emit_refusal(&self, plugin_id: &str, operation: &str, err: &HostError) {
        let mut data = json!({ "operation": operation });
        match err {
            HostError::DependencyCycle { cycle } => data["cycle"] = json!(cycle),
            HostError::DependentPluginsExist { dependents, .. } => data["dependents"] = json!(dependents),
            _ => {}
        }
        self.events.emit(
            PluginEvent::new(EventKind::Error, plugin_id)
                .with_data(data)
                .with_error(err.to_string()),
        );
    }

    fn launch_params(&self, plugin_id: &str) -> HostResult<(Arc<PluginManifest>, ConfigMap, PathBuf)> {
        self.registry
            .with_record(plugin_id, |r| (Arc::clone(&r.manifest), r.config.clone(), r.extraction_path.clone()))
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))
    }

    /// Runs one hook in a short-lived sandbox, for plugins that are not active.
    async fn run_transient_hook(
        &self,
        manifest: &PluginManifest,
        config: ConfigMap,
        install_dir: &Path,
        hook: Hook,
    ) -> HostResult<()> {
        if !manifest.declares_hook(hook) {
            return Ok(());
        }
        let handle = self
            .sandboxes
            .create_sandbox(manifest, self.config.limits, config, install_dir);
        let result = self.sandboxes.run_hook(handle.context(), hook).await;
        self.sandboxes.destroy_sandbox(&manifest.id);
        result.map(|_| ())
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }
    }
}

async fn supervise(manager: Weak<PluginManager>, mut violations: mpsc::Receiver<Violation>) {
    while let Some(violation) = violations.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_violation(violation).await;
    }
    debug!("Violation supervisor stopped");
}

/// The package's manifest must describe what the registry said it is.
fn check_identity(plugin_id: &str, version: &Version, manifest: &PluginManifest) -> HostResult<()> {
    if manifest.id != plugin_id {
        return Err(HostError::Registry(format!(
            "package for '{plugin_id}' declares id '{}'",
            manifest.id
        )));
    }
    match Version::parse(manifest.version.trim()) {
        Ok(declared) if declared == *version => Ok(()),
        _ => Err(HostError::Registry(format!(
            "package for '{plugin_id}@{version}' declares version '{}'",
            manifest.version
        ))),
    }
}

fn failure_data(step: InstallStep, err: &HostError) -> serde_json::Value {
    match err.root_cause() {
        HostError::ValidationFailed(report) => json!({
            "step": step,
            "findings": report.findings,
            "security_score": report.security_score,
        }),
        HostError::ConfigurationInvalid { issues, .. } => json!({ "step": step, "issues": issues }),
        _ => json!({ "step": step }),
    }
}
