mod common;

use async_trait::async_trait;
use common::{Harness, drain, manifest, package, with_dependency};
use plugdock_host::{
    EventKind, Hook, HookRuntime, HostError, InstallOutcome, InstallRequest, InstallStep,
    PluginRecord, PluginStatus, PolicyConfig, PolicyEngine, PolicyMode, PublishedVersion,
    RecordingHookRuntime, SandboxContext,
};
use plugdock_package::{
    ConfigField, ConfigMap, ConfigSchema, ConfigType, KeyPair, PackageBuilder, sha256_hex,
};
use pretty_assertions::assert_eq;
use semver::Version;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(value: serde_json::Value) -> ConfigMap {
    value.as_object().cloned().unwrap_or_default()
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

fn installed_record(id: &str, deps: &[(&str, &str)]) -> PluginRecord {
    let mut m = manifest(id, "1.0.0");
    for (dep, range) in deps {
        m = with_dependency(m, dep, range);
    }
    PluginRecord::new(
        m,
        Version::new(1, 0, 0),
        "0".repeat(64),
        PathBuf::from("/nonexistent"),
        ConfigMap::new(),
        ConfigMap::new(),
    )
}

// ── Install ─────────────────────────────────────────────────────

#[tokio::test]
async fn install_reaches_installed_with_full_progress() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    h.publish(manifest("p1", "1.2.0"));
    h.publish(manifest("p1", "2.0.0-beta.1"));
    let mut rx = h.manager.subscribe();

    let info = h.manager.install("p1", Some("^1.0.0"), None).await.unwrap();
    assert_eq!(info.version, "1.2.0");
    assert_eq!(info.status, PluginStatus::Installed);
    assert_eq!(h.manager.get_plugin_status("p1"), PluginStatus::Installed);

    let state = h.manager.installation_status("p1").unwrap();
    assert_eq!(state.progress, 100.0);
    assert_eq!(state.outcome, InstallOutcome::Completed);

    let events = drain(&mut rx);
    assert_eq!(events.first().map(|e| e.kind), Some(EventKind::InstallStarted));
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Installed).count(), 1);
    assert!(events.iter().all(|e| e.kind != EventKind::Error));

    let progress: Vec<f64> = events
        .iter()
        .filter(|e| e.kind == EventKind::Progress)
        .filter_map(|e| e.data.as_ref()?["progress"].as_f64())
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100.0));
}

#[tokio::test]
async fn install_without_range_picks_newest_stable() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    h.publish(manifest("p1", "1.4.2"));
    h.publish(manifest("p1", "2.0.0-rc.1"));

    let info = h.manager.install("p1", None, None).await.unwrap();
    assert_eq!(info.version, "1.4.2");
}

#[tokio::test]
async fn initialize_hook_runs_in_a_transient_sandbox() {
    let hooks = Arc::new(RecordingHookRuntime::new());
    let h = Harness::with_hooks(hooks.clone());
    h.publish(manifest("p1", "1.0.0"));

    let info = h.manager.install("p1", None, None).await.unwrap();
    assert_eq!(hooks.calls_for("p1"), vec![Hook::Initialize]);
    assert!(!info.sandbox_active());
    assert!(h.manager.get_plugin_metrics("p1").is_none());
}

#[tokio::test]
async fn second_install_is_rejected() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();

    let err = h.manager.install("p1", None, None).await.unwrap_err();
    assert!(matches!(err, HostError::PluginAlreadyInstalled(_)));
}

/// Holds the initialize hook open so an installation stays in flight.
struct SlowInitialize;

#[async_trait]
impl HookRuntime for SlowInitialize {
    async fn call(&self, hook: Hook, _ctx: &SandboxContext) -> anyhow::Result<()> {
        if hook == Hook::Initialize {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }
}

async fn wait_until_in_flight(h: &Harness, id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.manager.installation_status(id).is_some_and(|s| s.is_in_flight()) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn concurrent_install_fails_fast() {
    let h = Harness::with_hooks(Arc::new(SlowInitialize));
    h.publish(manifest("p1", "1.0.0"));
    let mut rx = h.manager.subscribe();

    let (first, second) = tokio::join!(h.manager.install("p1", None, None), async {
        wait_until_in_flight(&h, "p1").await;
        assert_eq!(h.manager.get_plugin_status("p1"), PluginStatus::Installing);
        h.manager.install("p1", None, None).await
    });

    assert_eq!(first.unwrap().status, PluginStatus::Installed);
    assert!(matches!(second, Err(HostError::InstallationAlreadyInProgress(ref id)) if id == "p1"));
    assert!(drain(&mut rx).iter().all(|e| e.kind != EventKind::Error));
    assert_eq!(h.manager.installation_history("p1").len(), 1);
}

#[tokio::test]
async fn concurrent_update_fails_fast() {
    let h = Harness::with_hooks(Arc::new(SlowInitialize));
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    h.publish(manifest("p1", "1.1.0"));

    let (first, (second, install)) = tokio::join!(h.manager.update("p1", None), async {
        wait_until_in_flight(&h, "p1").await;
        (h.manager.update("p1", None).await, h.manager.install("p1", None, None).await)
    });

    assert_eq!(first.unwrap().version, "1.1.0");
    assert!(matches!(second, Err(HostError::InstallationAlreadyInProgress(_))));
    assert!(matches!(install, Err(HostError::InstallationAlreadyInProgress(_))));
}

#[tokio::test]
async fn unknown_plugin_fails_at_download() {
    let h = Harness::new();
    let err = h.manager.install("ghost", None, None).await.unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Download));
    assert!(matches!(err.root_cause(), HostError::PluginNotFound(_)));
    assert_eq!(h.manager.get_plugin_status("ghost"), PluginStatus::NotInstalled);
}

#[tokio::test]
async fn unmatched_range_fails_at_download() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    let err = h.manager.install("p1", Some("^3"), None).await.unwrap_err();
    assert!(matches!(err.root_cause(), HostError::NoMatchingVersion { .. }));
}

#[tokio::test]
async fn checksum_mismatch_is_refused_and_not_cached() {
    let h = Harness::new();
    let blob = package(manifest("p1", "1.0.0"));
    h.registry
        .publish_entry("p1", PublishedVersion::new("1.0.0", "ab".repeat(32)), blob);

    let err = h.manager.install("p1", None, None).await.unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Download));
    assert!(matches!(err.root_cause(), HostError::ChecksumMismatch { .. }));
    assert!(err.is_security_relevant());
    assert!(h.cache.is_empty());
}

#[tokio::test]
async fn package_identity_must_match_listing() {
    let h = Harness::new();
    h.registry.publish("p1", "1.0.0", package(manifest("p1", "1.0.1")));

    let err = h.manager.install("p1", None, None).await.unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Validate));
    assert!(matches!(err.root_cause(), HostError::Registry(_)));
}

#[tokio::test]
async fn dangerous_code_fails_validation() {
    let h = Harness::new();
    let blob = PackageBuilder::new(manifest("p1", "1.0.0"))
        .entry_point("export function initialize() { eval(input); }\n")
        .file("assets/icon.svg", "<svg/>")
        .file("locales/en.json", "{}")
        .build()
        .unwrap();
    h.registry.publish("p1", "1.0.0", blob);
    let mut rx = h.manager.subscribe();

    let err = h.manager.install("p1", None, None).await.unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Validate));
    let HostError::ValidationFailed(report) = err.root_cause() else {
        panic!("expected validation failure, got {err}");
    };
    assert!(!report.valid);
    assert!(report.errors().count() >= 1);

    let failure = drain(&mut rx)
        .into_iter()
        .find(|e| e.kind == EventKind::Error)
        .unwrap();
    let data = failure.data.unwrap();
    assert_eq!(data["step"], json!("validate"));
    assert!(data["findings"].as_array().is_some_and(|f| !f.is_empty()));
    assert!(!has_entries(&h.manager.config().work_dir.join("p1")));
}

// ── Dependencies ────────────────────────────────────────────────

#[tokio::test]
async fn incompatible_dependency_fails_at_dependencies_step() {
    let h = Harness::new();
    h.publish(manifest("p1", "2.0.0"));
    h.publish(with_dependency(manifest("p2", "1.0.0"), "p1", "^1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    let mut rx = h.manager.subscribe();

    let err = h.manager.install("p2", None, None).await.unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Dependencies));
    assert!(matches!(err.root_cause(), HostError::DependencyUnsatisfied { .. }));
    assert_eq!(h.manager.get_plugin_status("p2"), PluginStatus::NotInstalled);
    assert!(h.manager.get_plugin("p2").is_none());
    assert!(!has_entries(&h.manager.config().work_dir.join("p2")));

    let state = h.manager.installation_status("p2").unwrap();
    assert_eq!(state.outcome, InstallOutcome::Failed);
    assert_eq!(state.failed_step, Some(InstallStep::Dependencies));

    let events = drain(&mut rx);
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::Error).count(), 1);
    assert!(events.iter().all(|e| e.kind != EventKind::Installed));
}

#[tokio::test]
async fn satisfied_dependency_installs() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.3.0"));
    h.publish(with_dependency(manifest("p2", "1.0.0"), "p1", "^1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();

    let info = h.manager.install("p2", None, None).await.unwrap();
    assert_eq!(info.dependencies.get("p1").map(String::as_str), Some("^1.0.0"));
}

#[tokio::test]
async fn enable_refuses_dependency_cycle() {
    let h = Harness::new();
    let registry = h.manager.registry();
    for (id, dep) in [("a", "b"), ("b", "c"), ("c", "a")] {
        registry.register(installed_record(id, &[(dep, "^1.0.0")])).unwrap();
        registry.transition(id, PluginStatus::Installed).unwrap();
    }
    let mut rx = h.manager.subscribe();

    let err = h.manager.enable("a").await.unwrap_err();
    let HostError::DependencyCycle { cycle } = err else {
        panic!("expected a cycle, got {err}");
    };
    assert_eq!(cycle, vec!["a", "b", "c", "a"]);
    assert_eq!(h.manager.get_plugin_status("a"), PluginStatus::Installed);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Error);
    assert_eq!(events[0].data.as_ref().unwrap()["cycle"], json!(["a", "b", "c", "a"]));
}

#[tokio::test]
async fn install_that_closes_a_cycle_is_refused() {
    let h = Harness::new();
    let registry = h.manager.registry();
    registry.register(installed_record("b", &[("a", "^1.0.0")])).unwrap();
    registry.transition("b", PluginStatus::Installed).unwrap();
    h.publish(with_dependency(manifest("a", "1.0.0"), "b", "^1.0.0"));

    let err = h.manager.install("a", None, None).await.unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Dependencies));
    let HostError::DependencyCycle { cycle } = err.root_cause() else {
        panic!("expected a cycle, got {err}");
    };
    assert_eq!(cycle, &vec!["a", "b", "a"]);
}

#[tokio::test]
async fn enable_requires_active_dependencies() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    h.publish(with_dependency(manifest("p2", "1.0.0"), "p1", "^1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    h.manager.install("p2", None, None).await.unwrap();

    let mut rx = h.manager.subscribe();
    let err = h.manager.enable("p2").await.unwrap_err();
    assert!(matches!(err, HostError::DependencyUnsatisfied { .. }));
    assert_eq!(h.manager.get_plugin_status("p2"), PluginStatus::Installed);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Error);
    assert_eq!(events[0].plugin_id, "p2");
    assert_eq!(events[0].data.as_ref().unwrap()["operation"], json!("enable"));
    assert!(events[0].error.as_ref().unwrap().contains("dependency unsatisfied"));

    h.manager.enable("p1").await.unwrap();
    let info = h.manager.enable("p2").await.unwrap();
    assert_eq!(info.status, PluginStatus::Active);
}

// ── Enable / disable ────────────────────────────────────────────

#[tokio::test]
async fn enable_and_disable_drive_hooks_and_sandbox() {
    let hooks = Arc::new(RecordingHookRuntime::new());
    let h = Harness::with_hooks(hooks.clone());
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    let mut rx = h.manager.subscribe();

    let info = h.manager.enable("p1").await.unwrap();
    assert_eq!(info.status, PluginStatus::Active);
    assert!(info.sandbox_active());
    let metrics = h.manager.get_plugin_metrics("p1").unwrap();
    assert_eq!(Some(metrics.sandbox_id), info.sandbox_id);
    assert!(!metrics.throttled);

    let info = h.manager.disable("p1").await.unwrap();
    assert_eq!(info.status, PluginStatus::Installed);
    assert!(h.manager.get_plugin_metrics("p1").is_none());

    assert_eq!(hooks.calls_for("p1"), vec![Hook::Initialize, Hook::Enable, Hook::Disable]);
    let kinds: Vec<EventKind> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Enabled, EventKind::Disabled]);
}

struct FailingEnable;

#[async_trait]
impl HookRuntime for FailingEnable {
    async fn call(&self, hook: Hook, _ctx: &SandboxContext) -> anyhow::Result<()> {
        if hook == Hook::Enable {
            anyhow::bail!("cannot start");
        }
        Ok(())
    }
}

#[tokio::test]
async fn failing_enable_hook_puts_plugin_in_error() {
    let h = Harness::with_hooks(Arc::new(FailingEnable));
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();

    let err = h.manager.enable("p1").await.unwrap_err();
    assert!(matches!(err, HostError::Hook { .. }));

    let info = h.manager.get_plugin("p1").unwrap();
    assert_eq!(info.status, PluginStatus::Error);
    assert!(info.last_error.as_deref().unwrap().contains("cannot start"));
    assert!(!info.sandbox_active());

    // Error only leads out through uninstall.
    assert!(matches!(
        h.manager.enable("p1").await,
        Err(HostError::InvalidStateTransition { .. })
    ));
    h.manager.uninstall("p1", false).await.unwrap();
    assert_eq!(h.manager.get_plugin_status("p1"), PluginStatus::NotInstalled);
}

#[tokio::test]
async fn disable_requires_active() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();

    let err = h.manager.disable("p1").await.unwrap_err();
    assert!(matches!(err, HostError::InvalidStateTransition { .. }));
}

// ── Supervision ─────────────────────────────────────────────────

struct MemoryHog;

#[async_trait]
impl HookRuntime for MemoryHog {
    async fn call(&self, hook: Hook, ctx: &SandboxContext) -> anyhow::Result<()> {
        if hook == Hook::Enable {
            ctx.usage().report_memory(8 * 1024 * 1024);
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_memory_violations_deactivate_plugin() {
    let h = Harness::with(
        |c| c.limits.max_memory_bytes = 1024 * 1024,
        Arc::new(MemoryHog),
        PolicyEngine::default(),
    );
    h.publish(manifest("p3", "1.0.0"));
    h.manager.install("p3", None, None).await.unwrap();
    let mut rx = h.manager.subscribe();
    h.manager.enable("p3").await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(30), async {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            match event.kind {
                EventKind::Violation | EventKind::Error => {
                    let done = event.kind == EventKind::Error;
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    let kinds: Vec<EventKind> = seen.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Violation, EventKind::Violation, EventKind::Error]);
    let first = seen[0].data.as_ref().unwrap();
    assert_eq!(first["resource"], json!("memory"));
    assert_eq!(first["count"], json!(1));
    assert_eq!(seen[1].data.as_ref().unwrap()["count"], json!(2));

    let info = h.manager.get_plugin("p3").unwrap();
    assert_eq!(info.status, PluginStatus::Error);
    assert!(info.last_error.unwrap().contains("resource limit exceeded"));
    assert!(h.manager.get_plugin_metrics("p3").is_none());
}

#[tokio::test(start_paused = true)]
async fn single_violation_only_throttles() {
    let h = Harness::with(
        |c| {
            c.limits.max_memory_bytes = 1024 * 1024;
            c.max_violations = 3;
        },
        Arc::new(MemoryHog),
        PolicyEngine::default(),
    );
    h.publish(manifest("p3", "1.0.0"));
    h.manager.install("p3", None, None).await.unwrap();
    let mut rx = h.manager.subscribe();
    h.manager.enable("p3").await.unwrap();

    let violation = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.kind == EventKind::Violation {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(violation.data.unwrap()["count"], json!(1));

    // The supervisor throttles right after emitting.
    tokio::task::yield_now().await;
    assert_eq!(h.manager.get_plugin_status("p3"), PluginStatus::Active);
    assert!(h.manager.get_plugin_metrics("p3").unwrap().throttled);
}

/// Goes over the memory ceiling during enable and keeps the hook running
/// across monitor ticks.
struct SlowHog {
    hold: Duration,
}

#[async_trait]
impl HookRuntime for SlowHog {
    async fn call(&self, hook: Hook, ctx: &SandboxContext) -> anyhow::Result<()> {
        if hook == Hook::Enable {
            ctx.usage().report_memory(8 * 1024 * 1024);
            tokio::time::sleep(self.hold).await;
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn violation_during_activation_throttles() {
    let h = Harness::with(
        |c| {
            c.limits.max_memory_bytes = 1024 * 1024;
            c.max_violations = 3;
        },
        Arc::new(SlowHog { hold: Duration::from_millis(1_500) }),
        PolicyEngine::default(),
    );
    h.publish(manifest("p3", "1.0.0"));
    h.manager.install("p3", None, None).await.unwrap();
    let mut rx = h.manager.subscribe();

    let info = h.manager.enable("p3").await.unwrap();
    assert_eq!(info.status, PluginStatus::Active);
    assert!(h.manager.get_plugin_metrics("p3").unwrap().throttled);

    let violation = drain(&mut rx)
        .into_iter()
        .find(|e| e.kind == EventKind::Violation)
        .unwrap();
    assert_eq!(violation.data.unwrap()["count"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn violations_during_activation_escalate_once_active() {
    let h = Harness::with(
        |c| c.limits.max_memory_bytes = 1024 * 1024,
        Arc::new(SlowHog { hold: Duration::from_millis(2_500) }),
        PolicyEngine::default(),
    );
    h.publish(manifest("p3", "1.0.0"));
    h.manager.install("p3", None, None).await.unwrap();
    let mut rx = h.manager.subscribe();
    h.manager.enable("p3").await.unwrap();

    let kinds = tokio::time::timeout(Duration::from_secs(30), async {
        let mut kinds = Vec::new();
        loop {
            let kind = rx.recv().await.unwrap().kind;
            kinds.push(kind);
            if kind == EventKind::Error {
                return kinds;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        kinds,
        vec![EventKind::Violation, EventKind::Violation, EventKind::Enabled, EventKind::Error]
    );
    assert_eq!(h.manager.get_plugin_status("p3"), PluginStatus::Error);
    assert!(h.manager.get_plugin_metrics("p3").is_none());
}

// ── Configuration ───────────────────────────────────────────────

fn configurable(version: &str) -> plugdock_package::PluginManifest {
    let mut m = manifest("p1", version);
    m.config_schema = ConfigSchema::new()
        .field("greeting", ConfigField::new(ConfigType::String).with_default(json!("hello")))
        .field(
            "retries",
            ConfigField::new(ConfigType::Number).range(Some(0.0), Some(5.0)),
        );
    m.hooks.push(Hook::Configure);
    m
}

#[tokio::test]
async fn invalid_install_config_fails_at_configure() {
    let h = Harness::new();
    h.publish(configurable("1.0.0"));
    let mut rx = h.manager.subscribe();

    let err = h
        .manager
        .install("p1", None, Some(config(json!({ "retries": 10 }))))
        .await
        .unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Configure));
    let HostError::ConfigurationInvalid { issues, .. } = err.root_cause() else {
        panic!("expected configuration failure, got {err}");
    };
    assert_eq!(issues[0].key, "retries");
    assert!(h.manager.get_plugin("p1").is_none());
    assert!(!has_entries(&h.manager.config().work_dir.join("p1")));

    let failure = drain(&mut rx)
        .into_iter()
        .find(|e| e.kind == EventKind::Error)
        .unwrap();
    assert_eq!(failure.data.unwrap()["issues"][0]["key"], json!("retries"));
}

#[tokio::test]
async fn install_config_merges_defaults_and_overrides() {
    let h = Harness::new();
    h.publish(configurable("1.0.0"));

    let info = h
        .manager
        .install("p1", None, Some(config(json!({ "retries": 2 }))))
        .await
        .unwrap();
    assert_eq!(info.config, config(json!({ "greeting": "hello", "retries": 2 })));
}

#[tokio::test]
async fn configuration_update_is_validated_and_announced() {
    let hooks = Arc::new(RecordingHookRuntime::new());
    let h = Harness::with_hooks(hooks.clone());
    h.publish(configurable("1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    h.manager.enable("p1").await.unwrap();
    let mut rx = h.manager.subscribe();

    let err = h
        .manager
        .update_configuration("p1", config(json!({ "retries": -1 })))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::ConfigurationInvalid { .. }));
    assert_eq!(h.manager.get_plugin("p1").unwrap().config, config(json!({ "greeting": "hello" })));

    let updated = h
        .manager
        .update_configuration("p1", config(json!({ "retries": 4 })))
        .await
        .unwrap();
    assert_eq!(updated, config(json!({ "greeting": "hello", "retries": 4 })));
    assert_eq!(hooks.calls_for("p1").last(), Some(&Hook::Configure));

    let kinds: Vec<EventKind> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Error, EventKind::ConfigurationUpdated]);
}

struct FailingConfigure;

#[async_trait]
impl HookRuntime for FailingConfigure {
    async fn call(&self, hook: Hook, _ctx: &SandboxContext) -> anyhow::Result<()> {
        if hook == Hook::Configure {
            anyhow::bail!("rejects new settings");
        }
        Ok(())
    }
}

#[tokio::test]
async fn failing_configure_hook_keeps_applied_configuration() {
    let h = Harness::with_hooks(Arc::new(FailingConfigure));
    h.publish(configurable("1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    h.manager.enable("p1").await.unwrap();
    let mut rx = h.manager.subscribe();

    let updated = h
        .manager
        .update_configuration("p1", config(json!({ "retries": 2 })))
        .await
        .unwrap();
    assert_eq!(updated, config(json!({ "greeting": "hello", "retries": 2 })));

    let info = h.manager.get_plugin("p1").unwrap();
    assert_eq!(info.config, updated);
    assert_eq!(info.status, PluginStatus::Active);

    let events = drain(&mut rx);
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::ConfigurationUpdated, EventKind::Error]);
    assert_eq!(events[1].data.as_ref().unwrap()["operation"], json!("configure"));
    assert!(events[1].error.as_ref().unwrap().contains("rejects new settings"));
}

// ── Update ──────────────────────────────────────────────────────

#[tokio::test]
async fn update_migrates_configuration() {
    let h = Harness::new();
    h.publish(configurable("1.0.0"));
    h.manager
        .install("p1", None, Some(config(json!({ "greeting": "hi", "retries": 3 }))))
        .await
        .unwrap();

    let mut next = manifest("p1", "1.1.0");
    next.config_schema = ConfigSchema::new()
        .field("greeting", ConfigField::new(ConfigType::String).with_default(json!("hello")));
    h.publish(next);
    let mut rx = h.manager.subscribe();

    let info = h.manager.update("p1", None).await.unwrap();
    assert_eq!(info.version, "1.1.0");
    assert_eq!(info.status, PluginStatus::Installed);
    assert_eq!(info.config, config(json!({ "greeting": "hi" })));

    let updated = drain(&mut rx)
        .into_iter()
        .find(|e| e.kind == EventKind::Updated)
        .unwrap();
    assert_eq!(updated.data.unwrap(), json!({ "from": "1.0.0", "to": "1.1.0" }));
}

#[tokio::test]
async fn update_of_active_plugin_reenables_it() {
    let hooks = Arc::new(RecordingHookRuntime::new());
    let h = Harness::with_hooks(hooks.clone());
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    let before = h.manager.enable("p1").await.unwrap();

    h.publish(manifest("p1", "1.1.0"));
    let info = h.manager.update("p1", Some("^1")).await.unwrap();
    assert_eq!(info.version, "1.1.0");
    assert_eq!(info.status, PluginStatus::Active);
    assert_ne!(info.sandbox_id, before.sandbox_id);
    assert_eq!(info.installed_at, before.installed_at);
    assert_eq!(
        hooks.calls_for("p1"),
        vec![Hook::Initialize, Hook::Enable, Hook::Disable, Hook::Initialize, Hook::Enable]
    );
}

#[tokio::test]
async fn update_to_same_version_is_a_no_op() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    let downloads = h.registry.download_count();

    let info = h.manager.update("p1", None).await.unwrap();
    assert_eq!(info.version, "1.0.0");
    assert_eq!(h.registry.download_count(), downloads);
}

#[tokio::test]
async fn failed_update_keeps_previous_version() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    h.manager.enable("p1").await.unwrap();

    h.registry.publish_entry(
        "p1",
        PublishedVersion::new("1.1.0", "cd".repeat(32)),
        package(manifest("p1", "1.1.0")),
    );
    let err = h.manager.update("p1", None).await.unwrap_err();
    assert!(matches!(err.root_cause(), HostError::ChecksumMismatch { .. }));

    let info = h.manager.get_plugin("p1").unwrap();
    assert_eq!(info.version, "1.0.0");
    assert_eq!(info.status, PluginStatus::Active);
    assert!(info.sandbox_active());
}

// ── Uninstall ───────────────────────────────────────────────────

#[tokio::test]
async fn uninstall_refuses_while_dependents_exist() {
    let hooks = Arc::new(RecordingHookRuntime::new());
    let h = Harness::with_hooks(hooks.clone());
    h.publish(manifest("p1", "1.0.0"));
    h.publish(with_dependency(manifest("p2", "1.0.0"), "p1", "^1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    h.manager.install("p2", None, None).await.unwrap();

    let mut rx = h.manager.subscribe();
    let err = h.manager.uninstall("p1", false).await.unwrap_err();
    let HostError::DependentPluginsExist { dependents, .. } = err else {
        panic!("expected dependents, got {err}");
    };
    assert_eq!(dependents, vec!["p2"]);
    assert_eq!(h.manager.get_plugin_status("p1"), PluginStatus::Installed);

    let refused = drain(&mut rx);
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].kind, EventKind::Error);
    assert_eq!(
        refused[0].data,
        Some(json!({ "operation": "uninstall", "dependents": ["p2"] }))
    );

    h.manager.uninstall("p1", true).await.unwrap();
    assert_eq!(h.manager.get_plugin_status("p1"), PluginStatus::NotInstalled);
    assert_eq!(hooks.calls_for("p1").last(), Some(&Hook::Uninstall));

    let uninstalled = drain(&mut rx)
        .into_iter()
        .find(|e| e.kind == EventKind::Uninstalled)
        .unwrap();
    assert_eq!(uninstalled.data.unwrap()["forced"], json!(true));
}

#[tokio::test]
async fn uninstall_active_plugin_tears_down_sandbox() {
    let hooks = Arc::new(RecordingHookRuntime::new());
    let h = Harness::with_hooks(hooks.clone());
    h.publish(manifest("p1", "1.0.0"));
    h.manager.install("p1", None, None).await.unwrap();
    let extraction = h.manager.get_plugin("p1").unwrap().extraction_path;
    h.manager.enable("p1").await.unwrap();

    h.manager.uninstall("p1", false).await.unwrap();
    assert!(h.manager.get_plugin("p1").is_none());
    assert!(h.manager.get_plugin_metrics("p1").is_none());
    assert!(!extraction.exists());
    assert_eq!(
        hooks.calls_for("p1"),
        vec![Hook::Initialize, Hook::Enable, Hook::Uninstall]
    );

    // Reinstall from the cached blob.
    let downloads = h.registry.download_count();
    h.manager.install("p1", None, None).await.unwrap();
    assert_eq!(h.registry.download_count(), downloads);
}

#[tokio::test]
async fn uninstall_unknown_plugin() {
    let h = Harness::new();
    assert!(matches!(
        h.manager.uninstall("ghost", false).await,
        Err(HostError::PluginNotFound(_))
    ));
}

// ── Cancellation ────────────────────────────────────────────────

#[tokio::test]
async fn cancelled_install_stops_before_download() {
    let h = Harness::new();
    h.publish(manifest("p1", "1.0.0"));
    let token = CancellationToken::new();
    token.cancel();

    let err = h
        .manager
        .install_with(InstallRequest::new("p1").cancel_token(token))
        .await
        .unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Download));
    assert!(matches!(err.root_cause(), HostError::Cancelled(_)));
    assert_eq!(h.registry.download_count(), 0);
    assert_eq!(h.manager.get_plugin_status("p1"), PluginStatus::NotInstalled);
    assert!(!h.manager.cancel_installation("p1"));
}

// ── Policy ──────────────────────────────────────────────────────

#[tokio::test]
async fn denylisted_plugin_is_refused() {
    let policy = PolicyEngine::with_config(PolicyConfig {
        mode: PolicyMode::Denylist,
        denied_plugin_ids: vec!["p1".into()],
        ..Default::default()
    });
    let h = Harness::with(|_| {}, Arc::new(RecordingHookRuntime::new()), policy);
    h.publish(manifest("p1", "1.0.0"));

    let err = h.manager.install("p1", None, None).await.unwrap_err();
    assert!(matches!(err.root_cause(), HostError::PolicyDenied(_)));
    assert_eq!(h.registry.download_count(), 0);
}

#[tokio::test]
async fn required_signatures_are_verified() {
    let publisher = KeyPair::generate();
    let key_hex = publisher.verifying_key.to_hex();
    let policy = PolicyEngine::with_config(PolicyConfig {
        allowed_signing_keys: vec![key_hex.clone()],
        require_signatures: true,
        ..Default::default()
    });
    let h = Harness::with(|_| {}, Arc::new(RecordingHookRuntime::new()), policy);

    let signed = PackageBuilder::new(manifest("signed", "1.0.0"))
        .entry_point("export function initialize() {}\n")
        .file("assets/icon.svg", "<svg/>")
        .file("locales/en.json", "{}")
        .sign(&publisher.signing_key)
        .build()
        .unwrap();
    h.registry.publish_entry(
        "signed",
        PublishedVersion::new("1.0.0", sha256_hex(&signed)).signed_by(key_hex.clone()),
        signed,
    );
    h.manager.install("signed", None, None).await.unwrap();

    let unsigned = package(manifest("unsigned", "1.0.0"));
    h.registry.publish_entry(
        "unsigned",
        PublishedVersion::new("1.0.0", sha256_hex(&unsigned)).signed_by(key_hex),
        unsigned,
    );
    let err = h.manager.install("unsigned", None, None).await.unwrap_err();
    assert_eq!(err.step(), Some(InstallStep::Validate));
    assert!(h.manager.get_plugin("unsigned").is_none());

    h.publish(manifest("anonymous", "1.0.0"));
    let err = h.manager.install("anonymous", None, None).await.unwrap_err();
    assert!(matches!(err.root_cause(), HostError::PolicyDenied(_)));
}

// ── Queries ─────────────────────────────────────────────────────

#[tokio::test]
async fn queries_reflect_registry() {
    let h = Harness::new();
    h.publish(manifest("b", "1.0.0"));
    h.publish(manifest("a", "1.0.0"));
    h.manager.install("b", None, None).await.unwrap();
    h.manager.install("a", None, None).await.unwrap();

    let ids: Vec<String> = h.manager.get_all_plugins().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(h.manager.get_plugin_metadata("a").unwrap().name, "Plugin a");
    assert!(h.manager.get_plugin_metadata("ghost").is_none());
    assert_eq!(h.manager.installation_history("a").len(), 1);
}
