//! Installation tracker: weighted, monotonic progress per in-flight install.
//!
//! At most one installation per plugin id is in flight. Finished attempts,
//! successful or not, move into a short per-plugin history.

use crate::error::{HostError, HostResult};
use crate::events::EventBus;
use chrono::{DateTime, Utc};
use plugdock_types::{EventKind, InstallStep, PluginEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Finished attempts kept per plugin.
const HISTORY_LIMIT: usize = 16;

/// Highest progress an unfinished installation may report.
const IN_FLIGHT_CEILING: f64 = 99.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    InProgress,
    Completed,
    Failed,
}

/// One installation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationState {
    pub plugin_id: String,
    pub step: InstallStep,
    /// Cumulative weighted progress, 0 to 100.
    pub progress: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failed_step: Option<InstallStep>,
    pub outcome: InstallOutcome,
}

impl InstallationState {
    fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            step: InstallStep::Download,
            progress: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            failed_step: None,
            outcome: InstallOutcome::InProgress,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.outcome == InstallOutcome::InProgress
    }
}

pub struct InstallationTracker {
    events: EventBus,
    active: Mutex<HashMap<String, InstallationState>>,
    history: Mutex<HashMap<String, VecDeque<InstallationState>>>,
}

impl InstallationTracker {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Begins tracking an installation.
    pub fn start(&self, plugin_id: &str) -> HostResult<()> {
        let state = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.contains_key(plugin_id) {
                return Err(HostError::InstallationAlreadyInProgress(plugin_id.to_string()));
            }
            let state = InstallationState::new(plugin_id);
            active.insert(plugin_id.to_string(), state.clone());
            state
        };

        info!(plugin_id = %plugin_id, "Installation started");
        self.events.emit(
            PluginEvent::new(EventKind::InstallStarted, plugin_id)
                .with_data(json!({ "step": state.step, "progress": state.progress })),
        );
        Ok(())
    }

    /// Moves to `step`, `fraction` of the way through it. Returns the new
    /// cumulative progress.
    pub fn advance(&self, plugin_id: &str, step: InstallStep, fraction: f64) -> HostResult<f64> {
        let progress = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let state = active
                .get_mut(plugin_id)
                .ok_or_else(|| HostError::NoInstallationInProgress(plugin_id.to_string()))?;
            if step < state.step {
                return Err(HostError::InvalidStepOrder {
                    plugin_id: plugin_id.to_string(),
                    current: state.step,
                    requested: step,
                });
            }

            let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
            let computed =
                f64::from(step.completed_weight_before()) + f64::from(step.weight()) * fraction;
            state.step = step;
            state.progress = computed.max(state.progress).min(IN_FLIGHT_CEILING);
            state.progress
        };

        debug!(plugin_id = %plugin_id, step = ?step, progress, "Installation progress");
        self.events.emit(
            PluginEvent::new(EventKind::Progress, plugin_id)
                .with_data(json!({ "step": step, "progress": progress })),
        );
        Ok(progress)
    }

    /// Marks the installation finished at 100%.
    pub fn complete(&self, plugin_id: &str) -> HostResult<InstallationState> {
        let mut state = self.take(plugin_id)?;
        state.progress = 100.0;
        state.completed_at = Some(Utc::now());
        state.outcome = InstallOutcome::Completed;
        self.archive(state.clone());

        info!(plugin_id = %plugin_id, "Installation completed");
        self.events.emit(
            PluginEvent::new(EventKind::Progress, plugin_id)
                .with_data(json!({ "step": state.step, "progress": state.progress })),
        );
        Ok(state)
    }

    /// Marks the installation failed at its current step.
    pub fn fail(&self, plugin_id: &str, error: impl Display) -> HostResult<InstallationState> {
        let mut state = self.take(plugin_id)?;
        let message = error.to_string();
        state.completed_at = Some(Utc::now());
        state.failed_step = Some(state.step);
        state.error = Some(message.clone());
        state.outcome = InstallOutcome::Failed;
        self.archive(state.clone());

        warn!(plugin_id = %plugin_id, step = ?state.step, "Installation failed: {message}");
        self.events.emit(
            PluginEvent::new(EventKind::Progress, plugin_id)
                .with_data(json!({ "step": state.step, "progress": state.progress, "failed": true }))
                .with_error(message),
        );
        Ok(state)
    }

    /// The in-flight installation, or else the most recent finished one.
    pub fn status(&self, plugin_id: &str) -> Option<InstallationState> {
        if let Some(state) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
        {
            return Some(state.clone());
        }
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .and_then(|attempts| attempts.back().cloned())
    }

    pub fn is_in_flight(&self, plugin_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(plugin_id)
    }

    /// Finished attempts, oldest first.
    pub fn history(&self, plugin_id: &str) -> Vec<InstallationState> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .map(|attempts| attempts.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn take(&self, plugin_id: &str) -> HostResult<InstallationState> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(plugin_id)
            .ok_or_else(|| HostError::NoInstallationInProgress(plugin_id.to_string()))
    }

    fn archive(&self, state: InstallationState) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let attempts = history.entry(state.plugin_id.clone()).or_default();
        if attempts.len() == HISTORY_LIMIT {
            attempts.pop_front();
        }
        attempts.push_back(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> InstallationTracker {
        InstallationTracker::new(EventBus::new(64))
    }

    #[test]
    fn weighted_progress() {
        let t = tracker();
        t.start("p1").unwrap();
        assert_eq!(t.advance("p1", InstallStep::Download, 0.5).unwrap(), 10.0);
        assert_eq!(t.advance("p1", InstallStep::Validate, 0.0).unwrap(), 20.0);
        assert_eq!(t.advance("p1", InstallStep::Dependencies, 1.0).unwrap(), 60.0);
        assert_eq!(t.advance("p1", InstallStep::Initialize, 1.0).unwrap(), 99.0);
        assert_eq!(t.complete("p1").unwrap().progress, 100.0);
    }

    #[test]
    fn second_start_is_rejected() {
        let t = tracker();
        t.start("p1").unwrap();
        assert!(matches!(t.start("p1"), Err(HostError::InstallationAlreadyInProgress(_))));
        t.start("p2").unwrap();
    }

    #[test]
    fn earlier_step_is_rejected() {
        let t = tracker();
        t.start("p1").unwrap();
        t.advance("p1", InstallStep::Extract, 0.0).unwrap();
        assert!(matches!(
            t.advance("p1", InstallStep::Download, 1.0),
            Err(HostError::InvalidStepOrder { .. })
        ));
    }

    #[test]
    fn fraction_is_clamped_and_never_regresses() {
        let t = tracker();
        t.start("p1").unwrap();
        assert_eq!(t.advance("p1", InstallStep::Download, 7.0).unwrap(), 20.0);
        assert_eq!(t.advance("p1", InstallStep::Download, -1.0).unwrap(), 20.0);
        assert_eq!(t.advance("p1", InstallStep::Download, f64::NAN).unwrap(), 20.0);
    }

    #[test]
    fn failure_is_archived_and_frees_the_slot() {
        let t = tracker();
        t.start("p1").unwrap();
        t.advance("p1", InstallStep::Dependencies, 0.0).unwrap();
        let failed = t.fail("p1", "missing dependency").unwrap();
        assert_eq!(failed.failed_step, Some(InstallStep::Dependencies));
        assert_eq!(failed.outcome, InstallOutcome::Failed);
        assert!(!t.is_in_flight("p1"));
        assert_eq!(t.status("p1").unwrap().error.as_deref(), Some("missing dependency"));

        t.start("p1").unwrap();
        assert!(t.status("p1").unwrap().is_in_flight());
        assert_eq!(t.history("p1").len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let t = tracker();
        for _ in 0..HISTORY_LIMIT + 3 {
            t.start("p1").unwrap();
            t.complete("p1").unwrap();
        }
        assert_eq!(t.history("p1").len(), HISTORY_LIMIT);
    }

    #[test]
    fn unknown_installation() {
        let t = tracker();
        assert!(t.status("ghost").is_none());
        assert!(matches!(
            t.advance("ghost", InstallStep::Download, 0.0),
            Err(HostError::NoInstallationInProgress(_))
        ));
        assert!(t.complete("ghost").is_err());
    }

    #[tokio::test]
    async fn progress_events_are_emitted_in_order() {
        let bus = EventBus::new(64);
        let t = InstallationTracker::new(bus.clone());
        let mut sub = bus.subscribe_plugin("p1");

        t.start("p1").unwrap();
        t.advance("p1", InstallStep::Download, 1.0).unwrap();
        t.advance("p1", InstallStep::Validate, 1.0).unwrap();
        t.complete("p1").unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let event = sub.recv().await.unwrap();
            seen.push(event.data.unwrap()["progress"].as_f64().unwrap());
        }
        assert_eq!(seen, vec![0.0, 20.0, 30.0, 100.0]);
    }
}
