//! Sandbox runtime: one isolated context per active plugin.
//!
//! Each sandbox owns:
//! - A permission set (manifest declarations minus policy denials)
//! - Brokers for storage, network, and the plugin-scoped event bus
//! - Live usage counters (memory, CPU time, connections)
//! - A supervision task that samples usage every interval and reports
//!   ceiling breaches as [`Violation`]s
//!
//! Destroying a sandbox aborts its supervision task and revokes every broker.

use crate::broker::{NetworkBroker, PluginEventBus, StorageBroker};
use crate::cache::path_component;
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::events::EventBus;
use crate::hooks::HookRuntime;
use crate::permissions::{Permission, PermissionSet};
use crate::policy::PolicyEngine;
use chrono::{DateTime, Utc};
use plugdock_package::{ConfigMap, Hook, PluginManifest};
use plugdock_types::SandboxId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the violation channel between monitors and the supervisor.
const VIOLATION_CHANNEL_CAPACITY: usize = 256;

/// Resource limits for a plugin sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    /// Share of one core, sampled per monitor interval.
    pub max_cpu_percent: f64,
    pub max_connections: u32,
    /// Deadline for a single hook call.
    pub hook_timeout_ms: u64,
}

impl ResourceLimits {
    pub fn first_party() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024, // 64MB
            max_cpu_percent: 80.0,
            max_connections: 16,
            hook_timeout_ms: 5_000,
        }
    }

    pub fn third_party() -> Self {
        Self {
            max_memory_bytes: 32 * 1024 * 1024, // 32MB
            max_cpu_percent: 50.0,
            max_connections: 4,
            hook_timeout_ms: 3_000,
        }
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::third_party()
    }
}

/// The ceiling a violation breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Connections,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Connections => "connections",
        })
    }
}

/// A detected breach of a sandbox ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub plugin_id: String,
    pub sandbox_id: SandboxId,
    pub resource: ResourceKind,
    pub observed: f64,
    pub limit: f64,
    pub at: DateTime<Utc>,
}

impl Violation {
    pub fn describe(&self) -> String {
        format!("{} usage {} exceeds limit {}", self.resource, self.observed, self.limit)
    }
}

/// Live usage counters, shared by the sandbox, its brokers, and its monitor.
#[derive(Debug, Default)]
pub struct ResourceUsage {
    memory_bytes: AtomicU64,
    peak_memory_bytes: AtomicU64,
    cpu_time_us: AtomicU64,
    cpu_percent_bits: AtomicU64,
    connections: AtomicU32,
    /// Highest concurrent connection count requested since the last sample.
    connection_demand: AtomicU32,
    hook_calls: AtomicU64,
}

impl ResourceUsage {
    /// Reported by the hook runtime, which is the only party that knows.
    pub fn report_memory(&self, bytes: u64) {
        self.memory_bytes.store(bytes, Ordering::Relaxed);
        self.peak_memory_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    pub fn cpu_time_ms(&self) -> u64 {
        self.cpu_time_us() / 1_000
    }

    fn cpu_time_us(&self) -> u64 {
        self.cpu_time_us.load(Ordering::Relaxed)
    }

    /// Attributes CPU time to the plugin. The sandbox charges time spent
    /// polling hooks; runtimes that execute work elsewhere report it here.
    pub fn add_cpu_time(&self, elapsed: Duration) {
        self.cpu_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// CPU share measured by the most recent sample.
    pub fn cpu_percent(&self) -> f64 {
        f64::from_bits(self.cpu_percent_bits.load(Ordering::Relaxed))
    }

    fn set_cpu_percent(&self, percent: f64) {
        self.cpu_percent_bits.store(percent.to_bits(), Ordering::Relaxed);
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Acquire)
    }

    /// Reserves a connection slot unless `max` are already open.
    /// Records the demand either way.
    pub(crate) fn try_acquire_connection(&self, max: u32) -> bool {
        let mut current = self.connections.load(Ordering::Acquire);
        loop {
            self.connection_demand.fetch_max(current + 1, Ordering::Relaxed);
            if current >= max {
                return false;
            }
            match self.connections.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn release_connection(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn take_connection_demand(&self) -> u32 {
        self.connection_demand
            .swap(self.connections(), Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            memory_bytes: self.memory_bytes(),
            peak_memory_bytes: self.peak_memory_bytes.load(Ordering::Relaxed),
            cpu_time_ms: self.cpu_time_ms(),
            cpu_percent: self.cpu_percent(),
            connections: self.connections(),
            hook_calls: self.hook_calls.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ResourceUsage`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub memory_bytes: u64,
    pub peak_memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub cpu_percent: f64,
    pub connections: u32,
    pub hook_calls: u64,
}

/// Resource metrics for an active plugin, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxMetrics {
    pub sandbox_id: SandboxId,
    pub usage: UsageSnapshot,
    pub limits: ResourceLimits,
    /// Memory usage as a ratio of the ceiling.
    pub memory_usage_ratio: f64,
    pub throttled: bool,
}

/// State shared by a sandbox, its brokers, and its monitor.
#[derive(Debug)]
pub(crate) struct SandboxShared {
    pub(crate) plugin_id: String,
    pub(crate) sandbox_id: SandboxId,
    pub(crate) limits: ResourceLimits,
    pub(crate) permissions: PermissionSet,
    pub(crate) usage: ResourceUsage,
    hooks: Vec<Hook>,
    entry_point: PathBuf,
    config: RwLock<ConfigMap>,
    revoked: AtomicBool,
    throttled: AtomicBool,
}

impl SandboxShared {
    pub(crate) fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub(crate) fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    /// Fails if the sandbox is gone or lacks `permission`.
    pub(crate) fn ensure(&self, permission: Permission) -> HostResult<()> {
        if self.is_revoked() {
            return Err(HostError::SandboxRevoked(self.plugin_id.clone()));
        }
        if !self.permissions.is_granted(permission) {
            return Err(HostError::PermissionDenied {
                plugin_id: self.plugin_id.clone(),
                permission: permission.broker_name().to_string(),
            });
        }
        Ok(())
    }

    fn check_limits(&self, cpu_percent: f64) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut breach = |resource, observed: f64, limit: f64| {
            violations.push(Violation {
                plugin_id: self.plugin_id.clone(),
                sandbox_id: self.sandbox_id,
                resource,
                observed,
                limit,
                at: Utc::now(),
            });
        };

        let memory = self.usage.memory_bytes();
        if memory > self.limits.max_memory_bytes {
            breach(ResourceKind::Memory, memory as f64, self.limits.max_memory_bytes as f64);
        }
        if cpu_percent > self.limits.max_cpu_percent {
            breach(ResourceKind::Cpu, cpu_percent, self.limits.max_cpu_percent);
        }
        let demand = self.usage.take_connection_demand();
        if demand > self.limits.max_connections {
            breach(ResourceKind::Connections, f64::from(demand), f64::from(self.limits.max_connections));
        }
        violations
    }
}

/// Everything a plugin's hooks can reach.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    shared: Arc<SandboxShared>,
    storage: StorageBroker,
    network: NetworkBroker,
    events: PluginEventBus,
}

impl SandboxContext {
    pub fn plugin_id(&self) -> &str {
        &self.shared.plugin_id
    }

    pub fn sandbox_id(&self) -> SandboxId {
        self.shared.sandbox_id
    }

    /// Absolute path of the plugin's entry file.
    pub fn entry_point(&self) -> &Path {
        &self.shared.entry_point
    }

    pub fn storage(&self) -> &StorageBroker {
        &self.storage
    }

    pub fn network(&self) -> &NetworkBroker {
        &self.network
    }

    pub fn events(&self) -> &PluginEventBus {
        &self.events
    }

    pub fn usage(&self) -> &ResourceUsage {
        &self.shared.usage
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.shared.limits
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.shared.permissions
    }

    /// The plugin's effective configuration.
    pub fn config(&self) -> ConfigMap {
        self.shared
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A live sandbox. Owned by the plugin's registry record.
#[derive(Debug)]
pub struct SandboxHandle {
    context: SandboxContext,
}

impl SandboxHandle {
    pub fn id(&self) -> SandboxId {
        self.context.sandbox_id()
    }

    pub fn plugin_id(&self) -> &str {
        self.context.plugin_id()
    }

    pub fn context(&self) -> &SandboxContext {
        &self.context
    }

    pub fn limits(&self) -> ResourceLimits {
        self.context.shared.limits
    }

    pub fn is_revoked(&self) -> bool {
        self.context.shared.is_revoked()
    }

    pub fn is_throttled(&self) -> bool {
        self.context.shared.is_throttled()
    }

    /// New network connections are refused while throttled.
    pub fn throttle(&self) {
        self.context.shared.throttled.store(true, Ordering::Release);
    }

    pub fn set_config(&self, config: ConfigMap) {
        *self
            .context
            .shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn metrics(&self) -> SandboxMetrics {
        let usage = self.context.shared.usage.snapshot();
        let limits = self.limits();
        SandboxMetrics {
            sandbox_id: self.id(),
            memory_usage_ratio: if limits.max_memory_bytes > 0 {
                usage.memory_bytes as f64 / limits.max_memory_bytes as f64
            } else {
                0.0
            },
            usage,
            limits,
            throttled: self.is_throttled(),
        }
    }
}

#[derive(Debug)]
struct LiveSandbox {
    shared: Arc<SandboxShared>,
    monitor: JoinHandle<()>,
}

/// Creates, supervises and destroys sandboxes.
pub struct SandboxRuntime {
    storage_root: PathBuf,
    monitor_interval: Duration,
    hooks: Arc<dyn HookRuntime>,
    policy: Arc<PolicyEngine>,
    events: EventBus,
    http: reqwest::Client,
    violations: mpsc::Sender<Violation>,
    live: Mutex<HashMap<String, LiveSandbox>>,
}

impl SandboxRuntime {
    /// Returns the runtime and the receiving end of its violation channel.
    pub fn new(
        config: &HostConfig,
        hooks: Arc<dyn HookRuntime>,
        policy: Arc<PolicyEngine>,
        events: EventBus,
    ) -> HostResult<(Self, mpsc::Receiver<Violation>)> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("PlugDock/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HostError::Network(format!("http client: {e}")))?;
        let (tx, rx) = mpsc::channel(VIOLATION_CHANNEL_CAPACITY);
        Ok((
            Self {
                storage_root: config.storage_dir.clone(),
                monitor_interval: config.monitor_interval(),
                hooks,
                policy,
                events,
                http,
                violations: tx,
                live: Mutex::new(HashMap::new()),
            },
            rx,
        ))
    }

    /// Builds a sandbox and starts supervising it.
    ///
    /// Any previous sandbox for the same plugin is destroyed first.
    /// Must be called from within a Tokio runtime.
    pub fn create_sandbox(
        &self,
        manifest: &PluginManifest,
        limits: ResourceLimits,
        config: ConfigMap,
        install_dir: &Path,
    ) -> SandboxHandle {
        let plugin_id = manifest.id.clone();
        if self.destroy_sandbox(&plugin_id) {
            warn!(plugin_id = %plugin_id, "Replaced an existing sandbox");
        }

        let permissions = PermissionSet::from_declared(&manifest.permissions, |p| {
            self.policy.is_permission_denied_by_policy(p)
        });
        let shared = Arc::new(SandboxShared {
            plugin_id: plugin_id.clone(),
            sandbox_id: SandboxId::new(),
            limits,
            permissions,
            usage: ResourceUsage::default(),
            hooks: manifest.hooks.clone(),
            entry_point: install_dir.join(&manifest.entry_point),
            config: RwLock::new(config),
            revoked: AtomicBool::new(false),
            throttled: AtomicBool::new(false),
        });

        let context = SandboxContext {
            storage: StorageBroker::new(
                Arc::clone(&shared),
                self.storage_root.join(path_component(&plugin_id)),
            ),
            network: NetworkBroker::new(
                Arc::clone(&shared),
                manifest.network_allow.clone(),
                Arc::clone(&self.policy),
                self.http.clone(),
            ),
            events: PluginEventBus::new(Arc::clone(&shared), self.events.clone()),
            shared: Arc::clone(&shared),
        };

        let monitor = tokio::spawn(monitor(
            Arc::clone(&shared),
            Instant::now(),
            self.monitor_interval,
            self.violations.clone(),
        ));

        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin_id.clone(), LiveSandbox {
                shared: Arc::clone(&shared),
                monitor,
            });

        info!(
            plugin_id = %plugin_id,
            sandbox_id = %shared.sandbox_id,
            permissions = ?shared.permissions.granted_permissions(),
            "Sandbox created"
        );
        SandboxHandle { context }
    }

    /// Tears down a plugin's sandbox: stops its monitor and revokes its
    /// brokers. Returns false if there was nothing to destroy.
    pub fn destroy_sandbox(&self, plugin_id: &str) -> bool {
        let removed = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id);

        match removed {
            Some(live) => {
                live.shared.revoked.store(true, Ordering::Release);
                live.monitor.abort();
                info!(plugin_id = %plugin_id, sandbox_id = %live.shared.sandbox_id, "Sandbox destroyed");
                true
            }
            None => {
                debug!(plugin_id = %plugin_id, "No sandbox to destroy");
                false
            }
        }
    }

    /// True if `sandbox_id` is the live sandbox of `plugin_id`.
    pub fn is_live(&self, plugin_id: &str, sandbox_id: SandboxId) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .is_some_and(|live| live.shared.sandbox_id == sandbox_id)
    }

    /// Throttles the live sandbox of `plugin_id` if it is `sandbox_id`.
    pub fn throttle(&self, plugin_id: &str, sandbox_id: SandboxId) -> bool {
        match self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
        {
            Some(live) if live.shared.sandbox_id == sandbox_id => {
                live.shared.throttled.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Runs `hook` if the manifest declared it. Returns whether it ran.
    ///
    /// Time spent polling the hook is charged to the sandbox as CPU time;
    /// time the hook spends parked on I/O or timers is not.
    pub async fn run_hook(&self, context: &SandboxContext, hook: Hook) -> HostResult<bool> {
        let shared = &context.shared;
        if shared.is_revoked() {
            return Err(HostError::SandboxRevoked(shared.plugin_id.clone()));
        }
        if !shared.hooks.contains(&hook) {
            debug!(plugin_id = %shared.plugin_id, hook = %hook, "Hook not declared, skipping");
            return Ok(false);
        }

        let timeout = shared.limits.hook_timeout();
        let call = CpuMetered {
            inner: self.hooks.call(hook, context),
            usage: &shared.usage,
        };
        let outcome = tokio::time::timeout(timeout, call).await;
        shared.usage.hook_calls.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {
                debug!(plugin_id = %shared.plugin_id, hook = %hook, "Hook completed");
                Ok(true)
            }
            Ok(Err(e)) => {
                warn!(plugin_id = %shared.plugin_id, hook = %hook, "Hook failed: {e:#}");
                Err(HostError::Hook {
                    plugin_id: shared.plugin_id.clone(),
                    hook: hook.to_string(),
                    message: format!("{e:#}"),
                })
            }
            Err(_) => {
                warn!(plugin_id = %shared.plugin_id, hook = %hook, "Hook timed out");
                Err(HostError::Timeout {
                    plugin_id: shared.plugin_id.clone(),
                    timeout_ms: shared.limits.hook_timeout_ms,
                })
            }
        }
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        let live = std::mem::take(&mut *self.live.lock().unwrap_or_else(PoisonError::into_inner));
        for (_, sandbox) in live {
            sandbox.shared.revoked.store(true, Ordering::Release);
            sandbox.monitor.abort();
        }
    }
}

/// Charges the wall time of every `poll` of `inner` to `usage`.
struct CpuMetered<'a, F> {
    inner: F,
    usage: &'a ResourceUsage,
}

impl<F: Future + Unpin> Future for CpuMetered<'_, F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let started = std::time::Instant::now();
        let poll = Pin::new(&mut this.inner).poll(cx);
        this.usage.add_cpu_time(started.elapsed());
        poll
    }
}

/// Samples usage every `interval` and reports breaches until the sandbox is
/// revoked or the supervisor goes away.
///
/// The first sample covers everything since `created`, including hooks that
/// ran before the task was first polled.
async fn monitor(
    shared: Arc<SandboxShared>,
    created: Instant,
    interval: Duration,
    violations: mpsc::Sender<Violation>,
) {
    let mut ticker = tokio::time::interval_at(created + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_cpu_us = 0;
    let mut last_sample = created;

    loop {
        ticker.tick().await;
        if shared.is_revoked() {
            break;
        }

        let now = Instant::now();
        let cpu_us = shared.usage.cpu_time_us();
        let elapsed_us = now.duration_since(last_sample).as_micros().max(1) as f64;
        let cpu_percent = cpu_us.saturating_sub(last_cpu_us) as f64 / elapsed_us * 100.0;
        shared.usage.set_cpu_percent(cpu_percent);
        last_cpu_us = cpu_us;
        last_sample = now;

        for violation in shared.check_limits(cpu_percent) {
            error!(
                plugin_id = %violation.plugin_id,
                sandbox_id = %violation.sandbox_id,
                resource = %violation.resource,
                observed = violation.observed,
                limit = violation.limit,
                "Resource limit exceeded"
            );
            if violations.send(violation).await.is_err() {
                debug!(plugin_id = %shared.plugin_id, "Violation receiver closed, stopping monitor");
                return;
            }
        }
    }
}
