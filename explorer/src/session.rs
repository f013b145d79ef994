//! Session state and the observer interface.
//!
//! A [`Session`] is created when exploration starts and dropped when it ends.
//! It is the single writer of the fingerprint store, the cycle guard and the
//! action history, so none of them need locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::core::cycle_guard::CycleGuard;
use crate::core::fingerprint::FingerprintStore;
use crate::core::prioritizer::ScoringContext;
use crate::core::types::{ActionHistoryEntry, ActionKind, Element, ScreenState, Screenshot};
use crate::error::ExploreError;
use crate::io::config::ExplorationSettings;

/// Discovery counter reported after every new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub discovered: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Which hard ceiling was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    States,
    Depth,
    ClickBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Visit,
    Click,
    Revisit,
    Backtrack,
    /// Expected pruning, not a failure.
    BudgetReached(Budget),
    DeviceActionFailed,
    ScopeRecovered,
    ScopeLost,
    /// A relaunch left a screen's remaining candidates unreachable.
    BranchAbandoned,
    OracleFallback,
}

/// One entry of the operator-facing session log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub kind: EventKind,
    pub message: String,
}

impl LogEvent {
    pub fn new(severity: Severity, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {:?}: {}", self.severity, self.kind, self.message)
    }
}

/// Session sink supplied to [`crate::explore::Explorer::explore`].
///
/// Every method defaults to a no-op so observers only implement what they need.
pub trait Observer {
    fn on_new_state(&mut self, _state: &ScreenState) {}
    fn on_progress(&mut self, _progress: Progress) {}
    fn on_log(&mut self, _event: &LogEvent) {}
    fn on_complete(&mut self) {}
    fn on_error(&mut self, _err: &ExploreError) {}
    fn on_stop(&mut self) {}
}

/// Forwards session events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_new_state(&mut self, state: &ScreenState) {
        info!(
            state = %state.id,
            activity = %state.activity,
            elements = state.elements.len(),
            "new state"
        );
    }

    fn on_progress(&mut self, progress: Progress) {
        info!(discovered = progress.discovered, max = progress.max, "progress");
    }

    fn on_log(&mut self, event: &LogEvent) {
        match event.severity {
            Severity::Info => info!(kind = ?event.kind, "{}", event.message),
            Severity::Warn => warn!(kind = ?event.kind, "{}", event.message),
            Severity::Error => error!(kind = ?event.kind, "{}", event.message),
        }
    }

    fn on_complete(&mut self) {
        info!("exploration complete");
    }

    fn on_error(&mut self, err: &ExploreError) {
        error!(err = %err, "exploration failed");
    }

    fn on_stop(&mut self) {
        info!("exploration stopped");
    }
}

/// Aggregate root of one exploration run.
#[derive(Debug)]
pub struct Session {
    pub settings: ExplorationSettings,
    stop: Arc<AtomicBool>,
    history: Vec<ActionHistoryEntry>,
    store: FingerprintStore,
    cycle_guard: CycleGuard,
    click_counts: HashMap<String, u32>,
}

impl Session {
    pub fn new(settings: ExplorationSettings, stop: Arc<AtomicBool>) -> Self {
        Self {
            settings,
            stop,
            history: Vec::new(),
            store: FingerprintStore::new(),
            cycle_guard: CycleGuard::default(),
            click_counts: HashMap::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn store(&self) -> &FingerprintStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FingerprintStore {
        &mut self.store
    }

    pub fn history(&self) -> &[ActionHistoryEntry] {
        &self.history
    }

    pub fn clicks(&self, fingerprint: &str) -> u32 {
        self.click_counts.get(fingerprint).copied().unwrap_or(0)
    }

    pub fn click_budget_spent(&self, fingerprint: &str) -> bool {
        self.clicks(fingerprint) >= self.settings.per_element_click_budget
    }

    pub fn record(
        &mut self,
        action: ActionKind,
        state: Arc<ScreenState>,
        element: Option<Element>,
        depth: usize,
        result: impl Into<String>,
    ) {
        self.history
            .push(ActionHistoryEntry::new(action, state, element, depth, result));
    }

    /// Count a tap against the element's budget and remember it for cycle detection.
    pub fn record_click(
        &mut self,
        state: Arc<ScreenState>,
        element: &Element,
        depth: usize,
        result: impl Into<String>,
    ) {
        *self
            .click_counts
            .entry(element.fingerprint.clone())
            .or_default() += 1;
        self.cycle_guard.record(element.fingerprint.clone());
        self.record(ActionKind::Click, state, Some(element.clone()), depth, result);
    }

    pub fn scoring_context<'a>(&'a self, screenshot: Option<&'a Screenshot>) -> ScoringContext<'a> {
        ScoringContext {
            goal_prompt: self.settings.goal(),
            history: &self.history,
            cycle_guard: &self.cycle_guard,
            screenshot,
        }
    }

    /// Tear down, keeping everything already committed.
    pub fn into_parts(self) -> (FingerprintStore, Vec<ActionHistoryEntry>) {
        (self.store, self.history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cycle_guard::CyclePattern;
    use crate::core::types::StateId;
    use crate::test_support::button;

    fn state() -> Arc<ScreenState> {
        Arc::new(ScreenState {
            id: StateId(0),
            fingerprint: "fp".to_string(),
            activity: "com.example/.MainActivity".to_string(),
            screenshot_fingerprint: String::new(),
            elements: Vec::new(),
            parent: None,
        })
    }

    #[test]
    fn click_counts_track_budget() {
        let mut settings = ExplorationSettings::for_app("com.example");
        settings.per_element_click_budget = 2;
        let mut session = Session::new(settings, Arc::new(AtomicBool::new(false)));
        let element = button(0, "Open");

        session.record_click(state(), &element, 0, "tapped");
        assert!(!session.click_budget_spent(&element.fingerprint));
        session.record_click(state(), &element, 0, "tapped");
        assert!(session.click_budget_spent(&element.fingerprint));
        assert_eq!(session.history().len(), 2);
    }

    #[test]
    fn clicks_feed_the_cycle_guard() {
        let mut session = Session::new(
            ExplorationSettings::for_app("com.example"),
            Arc::new(AtomicBool::new(false)),
        );
        let element = button(0, "Open");
        session.record_click(state(), &element, 0, "tapped");

        let context = session.scoring_context(None);
        assert_eq!(
            context.cycle_guard.classify(&element.fingerprint).pattern,
            CyclePattern::ImmediateRepeat
        );
    }

    #[test]
    fn stop_flag_is_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let session = Session::new(ExplorationSettings::for_app("com.example"), flag.clone());
        assert!(!session.is_stopped());
        flag.store(true, Ordering::SeqCst);
        assert!(session.is_stopped());
    }

    #[test]
    fn log_event_display_names_kind() {
        let event = LogEvent::new(
            Severity::Info,
            EventKind::BudgetReached(Budget::Depth),
            "depth 5 reached",
        );
        assert_eq!(
            event.to_string(),
            "[Info] BudgetReached(Depth): depth 5 reached"
        );
    }
}
