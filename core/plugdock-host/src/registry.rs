//! Plugin registry: the single source of truth for installed plugins.
//!
//! All status and configuration changes go through here. A record's status
//! and its sandbox stay consistent: the handle is present exactly while the
//! record is `active`.

use crate::error::{HostError, HostResult};
use crate::resolver::parse_range;
use crate::sandbox::{SandboxContext, SandboxHandle, SandboxMetrics};
use chrono::{DateTime, Utc};
use plugdock_package::{ConfigMap, PkgPermission, PluginManifest};
use plugdock_types::{PluginStatus, SandboxId};
use semver::Version;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Registry entry for one installed plugin.
#[derive(Debug)]
pub struct PluginRecord {
    pub manifest: Arc<PluginManifest>,
    pub version: Version,
    pub status: PluginStatus,
    /// Effective configuration: defaults merged with `overrides`.
    pub config: ConfigMap,
    /// Caller-supplied values only.
    pub overrides: ConfigMap,
    pub checksum: String,
    pub extraction_path: PathBuf,
    pub last_error: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    sandbox: Option<SandboxHandle>,
}

impl PluginRecord {
    /// A new record in the `installing` state.
    pub fn new(
        manifest: PluginManifest,
        version: Version,
        checksum: impl Into<String>,
        extraction_path: PathBuf,
        config: ConfigMap,
        overrides: ConfigMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            manifest: Arc::new(manifest),
            version,
            status: PluginStatus::Installing,
            config,
            overrides,
            checksum: checksum.into(),
            extraction_path,
            last_error: None,
            installed_at: now,
            updated_at: now,
            sandbox: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn dependencies(&self) -> &BTreeMap<String, String> {
        &self.manifest.dependencies
    }

    pub fn sandbox(&self) -> Option<&SandboxHandle> {
        self.sandbox.as_ref()
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.version.to_string(),
            description: self.manifest.description.clone(),
            author: self.manifest.author.clone(),
            status: self.status,
            config: self.config.clone(),
            dependencies: self.manifest.dependencies.clone(),
            permissions: self.manifest.permissions.clone(),
            checksum: self.checksum.clone(),
            extraction_path: self.extraction_path.clone(),
            sandbox_id: self.sandbox.as_ref().map(SandboxHandle::id),
            last_error: self.last_error.clone(),
            installed_at: self.installed_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub status: PluginStatus,
    pub config: ConfigMap,
    pub dependencies: BTreeMap<String, String>,
    pub permissions: Vec<PkgPermission>,
    pub checksum: String,
    pub extraction_path: PathBuf,
    pub sandbox_id: Option<SandboxId>,
    pub last_error: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginInfo {
    pub fn sandbox_active(&self) -> bool {
        self.sandbox_id.is_some()
    }
}

#[derive(Debug, Default)]
pub struct PluginRegistry {
    records: RwLock<HashMap<String, PluginRecord>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Membership ──────────────────────────────────────────────

    pub fn register(&self, record: PluginRecord) -> HostResult<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let id = record.id().to_string();
        if records.contains_key(&id) {
            return Err(HostError::PluginAlreadyInstalled(id));
        }
        info!(plugin_id = %id, version = %record.version, status = %record.status, "Plugin registered");
        records.insert(id, record);
        Ok(())
    }

    /// Removes a record and hands it back, sandbox included.
    pub fn unregister(&self, plugin_id: &str) -> HostResult<PluginRecord> {
        let record = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        info!(plugin_id = %plugin_id, "Plugin unregistered");
        Ok(record)
    }

    /// Swaps in a new record for an installed plugin, keeping its install
    /// time. Returns the previous record.
    pub fn replace(&self, mut record: PluginRecord) -> HostResult<PluginRecord> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let id = record.id().to_string();
        let previous = records
            .remove(&id)
            .ok_or_else(|| HostError::PluginNotFound(id.clone()))?;
        record.installed_at = previous.installed_at;
        record.updated_at = Utc::now();
        info!(plugin_id = %id, from = %previous.version, to = %record.version, "Plugin record replaced");
        records.insert(id, record);
        Ok(previous)
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.read().contains_key(plugin_id)
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn get(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.read().get(plugin_id).map(PluginRecord::info)
    }

    /// Every record, sorted by id.
    pub fn get_all(&self) -> Vec<PluginInfo> {
        let mut all: Vec<PluginInfo> = self.read().values().map(PluginRecord::info).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn get_by_status(&self, status: PluginStatus) -> Vec<PluginInfo> {
        self.get_all()
            .into_iter()
            .filter(|info| info.status == status)
            .collect()
    }

    pub fn status(&self, plugin_id: &str) -> Option<PluginStatus> {
        self.read().get(plugin_id).map(|r| r.status)
    }

    pub fn manifest(&self, plugin_id: &str) -> Option<Arc<PluginManifest>> {
        self.read().get(plugin_id).map(|r| Arc::clone(&r.manifest))
    }

    /// Runs `f` against a record without copying it out.
    pub fn with_record<R>(&self, plugin_id: &str, f: impl FnOnce(&PluginRecord) -> R) -> Option<R> {
        self.read().get(plugin_id).map(f)
    }

    /// Context of the live sandbox, for running hooks outside the lock.
    pub fn sandbox_context(&self, plugin_id: &str) -> Option<SandboxContext> {
        self.read()
            .get(plugin_id)
            .and_then(|r| r.sandbox.as_ref())
            .map(|s| s.context().clone())
    }

    pub fn sandbox_id(&self, plugin_id: &str) -> Option<SandboxId> {
        self.read()
            .get(plugin_id)
            .and_then(|r| r.sandbox.as_ref())
            .map(SandboxHandle::id)
    }

    pub fn metrics(&self, plugin_id: &str) -> Option<SandboxMetrics> {
        self.read()
            .get(plugin_id)
            .and_then(|r| r.sandbox.as_ref())
            .map(SandboxHandle::metrics)
    }

    /// Ids of installed plugins that declare `plugin_id` as a dependency.
    pub fn dependents_of(&self, plugin_id: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .read()
            .values()
            .filter(|r| r.dependencies().contains_key(plugin_id))
            .map(|r| r.id().to_string())
            .collect();
        dependents.sort();
        dependents
    }

    // ── Configuration ───────────────────────────────────────────

    /// Merges `partial` into the plugin's overrides and validates the result
    /// against its schema. Nothing changes unless validation passes.
    /// Returns the new effective configuration.
    pub fn update_configuration(&self, plugin_id: &str, partial: &ConfigMap) -> HostResult<ConfigMap> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;

        let mut overrides = record.overrides.clone();
        for (key, value) in partial {
            overrides.insert(key.clone(), value.clone());
        }
        let config = record
            .manifest
            .config_schema
            .resolve(&record.manifest.default_config, &overrides)
            .map_err(|issues| HostError::ConfigurationInvalid {
                plugin_id: plugin_id.to_string(),
                issues,
            })?;

        if let Some(sandbox) = &record.sandbox {
            sandbox.set_config(config.clone());
        }
        record.overrides = overrides;
        record.config = config.clone();
        record.updated_at = Utc::now();
        debug!(plugin_id = %plugin_id, "Configuration updated");
        Ok(config)
    }

    // ── Dependencies ────────────────────────────────────────────

    /// Checks that `plugin_id` may be activated: no dependency cycle is
    /// reachable from it, and every direct dependency is active at a
    /// compatible version.
    pub fn validate_dependencies(&self, plugin_id: &str) -> HostResult<()> {
        let records = self.read();
        let record = records
            .get(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;

        let lookup = |id: &str| -> Option<Vec<String>> {
            records.get(id).map(|r| r.dependencies().keys().cloned().collect())
        };
        if let Some(cycle) = find_cycle(plugin_id, &lookup) {
            return Err(HostError::DependencyCycle { cycle });
        }

        for (dep_id, range) in record.dependencies() {
            let dep = records.get(dep_id);
            check_dependency(plugin_id, dep_id, range, dep, |status| status == PluginStatus::Active)?;
        }
        Ok(())
    }

    /// Checks that every dependency of a plugin about to be installed is
    /// already installed at a compatible version, and that installing it
    /// would not close a cycle.
    pub fn check_install_dependencies(&self, manifest: &PluginManifest) -> HostResult<()> {
        let records = self.read();

        let lookup = |id: &str| -> Option<Vec<String>> {
            if id == manifest.id {
                Some(manifest.dependencies.keys().cloned().collect())
            } else {
                records.get(id).map(|r| r.dependencies().keys().cloned().collect())
            }
        };
        if let Some(cycle) = find_cycle(&manifest.id, &lookup) {
            return Err(HostError::DependencyCycle { cycle });
        }

        for (dep_id, range) in &manifest.dependencies {
            let dep = records.get(dep_id);
            check_dependency(&manifest.id, dep_id, range, dep, |status| {
                !matches!(status, PluginStatus::NotInstalled | PluginStatus::Installing)
            })?;
        }
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Moves a record along the state machine. Returns the previous status.
    pub fn transition(&self, plugin_id: &str, to: PluginStatus) -> HostResult<PluginStatus> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        let from = record.status;
        if !from.can_transition_to(to) || to.has_sandbox() {
            return Err(HostError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from,
                to,
            });
        }
        record.status = to;
        record.updated_at = Utc::now();
        if to != PluginStatus::Error {
            record.last_error = None;
        }
        debug!(plugin_id = %plugin_id, from = %from, to = %to, "Status changed");
        Ok(from)
    }

    /// `activating` -> `active`, taking ownership of the sandbox.
    pub fn activate(&self, plugin_id: &str, sandbox: SandboxHandle) -> HostResult<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        if record.status != PluginStatus::Activating {
            return Err(HostError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: record.status,
                to: PluginStatus::Active,
            });
        }
        record.status = PluginStatus::Active;
        record.sandbox = Some(sandbox);
        record.last_error = None;
        record.updated_at = Utc::now();
        info!(plugin_id = %plugin_id, "Plugin active");
        Ok(())
    }

    /// Leaves `active` for `to`, handing back the sandbox.
    pub fn deactivate(&self, plugin_id: &str, to: PluginStatus) -> HostResult<Option<SandboxHandle>> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(plugin_id)
            .ok_or_else(|| HostError::PluginNotFound(plugin_id.to_string()))?;
        if record.status != PluginStatus::Active || !PluginStatus::Active.can_transition_to(to) {
            return Err(HostError::InvalidStateTransition {
                plugin_id: plugin_id.to_string(),
                from: record.status,
                to,
            });
        }
        record.status = to;
        record.updated_at = Utc::now();
        debug!(plugin_id = %plugin_id, to = %to, "Plugin leaving active state");
        Ok(record.sandbox.take())
    }

    pub fn set_error(&self, plugin_id: &str, message: impl Into<String>) {
        if let Some(record) = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(plugin_id)
        {
            record.last_error = Some(message.into());
            record.updated_at = Utc::now();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PluginRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_dependency(
    plugin_id: &str,
    dep_id: &str,
    range: &str,
    dep: Option<&PluginRecord>,
    status_ok: impl Fn(PluginStatus) -> bool,
) -> HostResult<()> {
    let unsatisfied = |reason: String| HostError::DependencyUnsatisfied {
        plugin_id: plugin_id.to_string(),
        reason,
    };

    let dep = dep.ok_or_else(|| unsatisfied(format!("'{dep_id}' is not installed")))?;
    if !status_ok(dep.status) {
        return Err(unsatisfied(format!("'{dep_id}' is {}", dep.status)));
    }
    let req = parse_range(range)?;
    if !req.matches(&dep.version) {
        return Err(unsatisfied(format!(
            "'{dep_id}' {} does not satisfy '{range}'",
            dep.version
        )));
    }
    Ok(())
}

/// Depth-first search for a dependency cycle reachable from `start`.
/// Returns the cycle as a path whose first and last ids are equal.
fn find_cycle(start: &str, deps_of: &dyn Fn(&str) -> Option<Vec<String>>) -> Option<Vec<String>> {
    fn visit(
        node: &str,
        deps_of: &dyn Fn(&str) -> Option<Vec<String>>,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|p| p == node) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }
        let deps = deps_of(node)?;
        path.push(node.to_string());
        for dep in &deps {
            if let Some(cycle) = visit(dep, deps_of, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(node.to_string());
        None
    }

    visit(start, deps_of, &mut Vec::new(), &mut HashSet::new())
}
