//! The exploration engine: a recursive, budgeted depth-first traversal of the
//! target app's screens, driven through a [`DeviceDriver`].
//!
//! Every device call is a blocking suspension point. The stop flag is checked
//! at the top of each recursion and after every device call; once it is set no
//! further device actions are issued and the stack unwinds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::fingerprint::{StateGraph, content_hash, screen_fingerprint};
use crate::core::hierarchy::parse_hierarchy;
use crate::core::prioritizer::{CandidateScorer, ScoreSource, prioritize};
use crate::core::types::{
    ActionHistoryEntry, ActionKind, Element, Observation, ScreenState, Screenshot, StateId,
};
use crate::error::ExploreError;
use crate::io::config::ExplorationSettings;
use crate::io::device::DeviceDriver;
use crate::session::{Budget, EventKind, LogEvent, Observer, Progress, Session, Severity};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExploreOutcome {
    /// `max_states` distinct screens were discovered.
    Completed,
    /// Every reachable candidate within the budgets was tried.
    Exhausted,
    /// An external stop request ended the session.
    Stopped,
    /// A fatal error ended the session.
    Failed(ExploreError),
}

impl ExploreOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExploreOutcome::Completed => "completed",
            ExploreOutcome::Exhausted => "exhausted",
            ExploreOutcome::Stopped => "stopped",
            ExploreOutcome::Failed(_) => "failed",
        }
    }
}

/// Everything a session committed, whatever the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ExplorationResult {
    #[serde(skip)]
    pub outcome: ExploreOutcome,
    pub states: Vec<Arc<ScreenState>>,
    pub graph: StateGraph,
    pub history: Vec<ActionHistoryEntry>,
}

/// Cloneable stop trigger, usable from other threads and observer callbacks.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

static GLOBAL: LazyLock<Explorer> = LazyLock::new(Explorer::new);

/// Runs at most one exploration session at a time.
///
/// Exclusion covers an `Explorer` and its clones. Everything driving the same
/// device must share one; [`Explorer::global`] is the process-wide instance.
#[derive(Debug, Clone, Default)]
pub struct Explorer {
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

/// Releases the session slot and consumes any stop request on drop.
struct SessionGuard<'a> {
    running: &'a AtomicBool,
    stop: &'a AtomicBool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.stop.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Explorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Explorer {
        &GLOBAL
    }

    /// Ask the running session to stop.
    ///
    /// A request made while no session runs cancels the next one; each session
    /// consumes the pending request when it ends.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Explore the app currently on screen.
    ///
    /// Only invalid settings and a concurrent session are reported as `Err`;
    /// everything that happens once the session is running ends up in
    /// [`ExplorationResult::outcome`] and the observer.
    #[instrument(skip_all, fields(app = %settings.app_id, mode = settings.mode.as_str()))]
    pub fn explore<D, S, O>(
        &self,
        driver: &D,
        settings: ExplorationSettings,
        scorer: &mut S,
        observer: &mut O,
    ) -> Result<ExplorationResult, ExploreError>
    where
        D: DeviceDriver + ?Sized,
        S: CandidateScorer + ?Sized,
        O: Observer + ?Sized,
    {
        settings
            .validate()
            .map_err(|err| ExploreError::InvalidSettings(format!("{err:#}")))?;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ExploreError::SessionActive);
        }
        let _guard = SessionGuard {
            running: &self.running,
            stop: &self.stop,
        };

        info!(
            max_states = settings.max_states,
            max_depth = settings.max_depth,
            "exploration started"
        );
        let mut traversal = Traversal {
            driver,
            scorer,
            observer,
            session: Session::new(settings, Arc::clone(&self.stop)),
            completed: false,
            relaunches: 0,
            on_screen: None,
        };
        let walked = traversal.explore_from(None, 0);

        let outcome = match walked {
            Err(err) => {
                traversal.observer.on_error(&err);
                ExploreOutcome::Failed(err)
            }
            Ok(_) if traversal.completed => {
                traversal.observer.on_complete();
                ExploreOutcome::Completed
            }
            Ok(_) if traversal.session.is_stopped() => {
                traversal.observer.on_stop();
                ExploreOutcome::Stopped
            }
            Ok(_) => {
                traversal.observer.on_complete();
                ExploreOutcome::Exhausted
            }
        };

        let (store, history) = traversal.session.into_parts();
        info!(
            outcome = outcome.as_str(),
            states = store.len(),
            actions = history.len(),
            "exploration finished"
        );
        Ok(ExplorationResult {
            outcome,
            states: store.states().to_vec(),
            graph: store.graph(),
            history,
        })
    }
}

/// One running session plus its collaborators.
struct Traversal<'a, D: ?Sized, S: ?Sized, O: ?Sized> {
    driver: &'a D,
    scorer: &'a mut S,
    observer: &'a mut O,
    session: Session,
    /// `max_states` was reached; distinguishes completion from an external stop.
    completed: bool,
    /// Bumped whenever the app is relaunched to recover scope.
    relaunches: usize,
    /// Last state known to be in the foreground.
    on_screen: Option<StateId>,
}

impl<D, S, O> Traversal<'_, D, S, O>
where
    D: DeviceDriver + ?Sized,
    S: CandidateScorer + ?Sized,
    O: Observer + ?Sized,
{
    /// Explore the screen currently shown, reached from `parent`.
    ///
    /// Returns the state that was observed, if any.
    fn explore_from(
        &mut self,
        parent: Option<StateId>,
        depth: usize,
    ) -> Result<Option<StateId>, ExploreError> {
        if self.session.is_stopped() {
            return Ok(None);
        }

        let activity = self.current_activity();
        if self.session.is_stopped() {
            return Ok(None);
        }
        let launches = self.relaunches;
        let activity = self.ensure_in_scope(activity)?;
        if self.session.is_stopped() {
            return Ok(None);
        }
        // After a relaunch the screen is the app's entry point, not a child of `parent`.
        let parent = if self.relaunches == launches { parent } else { None };

        let Some((observation, screenshot)) = self.observe(activity) else {
            return Ok(None);
        };
        if self.session.is_stopped() {
            return Ok(None);
        }

        let registration = self.session.store_mut().register_if_new(observation, parent);
        let state = registration.state;
        self.on_screen = Some(state.id);
        if !registration.is_new {
            self.session
                .record(ActionKind::Revisit, Arc::clone(&state), None, depth, "known state");
            self.log(
                Severity::Info,
                EventKind::Revisit,
                format!("revisited {} ({})", state.id, state.activity_name()),
            );
            return Ok(Some(state.id));
        }

        self.session
            .record(ActionKind::Visit, Arc::clone(&state), None, depth, "new state");
        self.observer.on_new_state(&state);
        let discovered = self.session.store().len();
        let max = self.session.settings.max_states;
        self.observer.on_progress(Progress { discovered, max });
        self.log(
            Severity::Info,
            EventKind::Visit,
            format!(
                "discovered {} ({}) with {} elements at depth {depth}",
                state.id,
                state.activity_name(),
                state.elements.len()
            ),
        );

        if discovered >= max {
            self.log(
                Severity::Info,
                EventKind::BudgetReached(Budget::States),
                format!("reached max_states ({max})"),
            );
            self.completed = true;
            self.session.request_stop();
            return Ok(Some(state.id));
        }
        if depth >= self.session.settings.max_depth {
            self.log(
                Severity::Info,
                EventKind::BudgetReached(Budget::Depth),
                format!("reached max_depth ({depth}) at {}", state.id),
            );
            return Ok(Some(state.id));
        }

        let candidates: Vec<Element> = state
            .elements
            .iter()
            .filter(|e| e.interactable && !self.session.settings.is_ignored(&e.class_name))
            .cloned()
            .collect();
        let ranking = {
            let context = self.session.scoring_context(Some(&screenshot));
            prioritize(
                self.session.settings.mode,
                candidates,
                &mut *self.scorer,
                &context,
            )
        };
        match ranking.source {
            Some(ScoreSource::RegexFallback) => self.log(
                Severity::Warn,
                EventKind::OracleFallback,
                "oracle answer was unstructured; scores extracted by regex",
            ),
            Some(ScoreSource::Random) => self.log(
                Severity::Warn,
                EventKind::OracleFallback,
                "oracle unavailable or unparsable; candidates scored at random",
            ),
            Some(ScoreSource::Oracle) | None => {}
        }
        debug!(state = %state.id, candidates = ranking.candidates.len(), "candidates ranked");

        for candidate in ranking.candidates {
            if self.session.is_stopped() {
                break;
            }
            let element = candidate.element;
            if self.session.click_budget_spent(&element.fingerprint) {
                self.log(
                    Severity::Info,
                    EventKind::BudgetReached(Budget::ClickBudget),
                    format!("click budget spent for {}", describe(&element)),
                );
                continue;
            }

            let (x, y) = element.bounds.center();
            if let Err(err) = self.driver.tap(x, y) {
                let err = ExploreError::device("tap", &err);
                self.log(Severity::Warn, EventKind::DeviceActionFailed, err.to_string());
                continue;
            }
            let result = match candidate.score {
                Some(score) => format!("tapped ({x}, {y}), score {score:.1}"),
                None => format!("tapped ({x}, {y})"),
            };
            self.session
                .record_click(Arc::clone(&state), &element, depth, result);
            self.log(
                Severity::Info,
                EventKind::Click,
                format!("tapped {} on {}", describe(&element), state.id),
            );
            self.settle();
            if self.session.is_stopped() {
                break;
            }

            let launches = self.relaunches;
            let reached = self.explore_from(Some(state.id), depth + 1)?;
            if self.session.is_stopped() {
                break;
            }
            if self.relaunches != launches {
                if self.on_screen == Some(state.id) {
                    continue;
                }
                self.abandon(&state);
                return Ok(Some(state.id));
            }

            if reached == Some(state.id) {
                debug!(state = %state.id, "tap did not change the screen; not navigating back");
            } else {
                match self.driver.navigate_back() {
                    Ok(()) => self.log(
                        Severity::Info,
                        EventKind::Backtrack,
                        format!("navigated back to {}", state.id),
                    ),
                    Err(err) => {
                        let err = ExploreError::device("navigate_back", &err);
                        self.log(Severity::Warn, EventKind::DeviceActionFailed, err.to_string());
                    }
                }
                self.settle();
                if self.session.is_stopped() {
                    break;
                }
            }

            let activity = self.current_activity();
            if self.session.is_stopped() {
                break;
            }
            let activity = self.ensure_in_scope(activity)?;
            if self.session.is_stopped() {
                break;
            }
            if self.relaunches == launches {
                self.on_screen = Some(state.id);
                continue;
            }
            self.on_screen = self.identify(activity);
            if self.session.is_stopped() {
                break;
            }
            if self.on_screen != Some(state.id) {
                self.abandon(&state);
                return Ok(Some(state.id));
            }
        }

        Ok(Some(state.id))
    }

    /// Which known state is in the foreground, if any.
    fn identify(&mut self, activity: Option<String>) -> Option<StateId> {
        let (observation, _) = self.observe(activity)?;
        self.session.store().find(&observation.fingerprint)
    }

    fn abandon(&mut self, state: &ScreenState) {
        let landed = match self.on_screen {
            Some(id) => id.to_string(),
            None => "an unknown screen".to_string(),
        };
        self.log(
            Severity::Warn,
            EventKind::BranchAbandoned,
            format!(
                "app relaunched onto {landed}; leaving remaining candidates of {}",
                state.id
            ),
        );
    }

    /// Foreground activity, or `None` when the driver could not tell.
    fn current_activity(&mut self) -> Option<String> {
        match self.driver.current_activity() {
            Ok(activity) => Some(activity),
            Err(err) => {
                let err = ExploreError::device("current_activity", &err);
                self.log(Severity::Warn, EventKind::DeviceActionFailed, err.to_string());
                None
            }
        }
    }

    /// Relaunch the target app if `activity` is outside scope.
    ///
    /// Returns the activity in the foreground afterwards. An unknown activity
    /// skips the check.
    fn ensure_in_scope(&mut self, activity: Option<String>) -> Result<Option<String>, ExploreError> {
        let Some(mut activity) = activity else {
            return Ok(None);
        };
        if !self.session.settings.stay_in_scope || self.session.settings.in_scope(&activity) {
            return Ok(Some(activity));
        }

        self.log(
            Severity::Warn,
            EventKind::ScopeLost,
            format!("left target app: foreground activity is {activity}"),
        );
        self.relaunches += 1;
        let app_id = self.session.settings.app_id.clone();
        let attempts = self.session.settings.max_recovery_attempts;
        for attempt in 1..=attempts {
            if self.session.is_stopped() {
                return Ok(Some(activity));
            }
            if let Err(err) = self.driver.launch_app(&app_id) {
                let err = ExploreError::device("launch_app", &err);
                self.log(Severity::Warn, EventKind::DeviceActionFailed, err.to_string());
            }
            self.settle();
            if self.session.is_stopped() {
                return Ok(Some(activity));
            }
            let Some(now) = self.current_activity() else {
                continue;
            };
            if self.session.settings.in_scope(&now) {
                self.log(
                    Severity::Info,
                    EventKind::ScopeRecovered,
                    format!("relaunched {app_id} after {attempt} attempt(s)"),
                );
                return Ok(Some(now));
            }
            activity = now;
        }

        let err = ExploreError::ScopeLoss {
            app_id,
            activity,
            attempts,
        };
        self.log(Severity::Error, EventKind::ScopeLost, err.to_string());
        Err(err)
    }

    /// Capture and parse the current screen. `None` skips the branch.
    fn observe(&mut self, activity: Option<String>) -> Option<(Observation, Screenshot)> {
        let xml = match self.driver.capture_hierarchy() {
            Ok(xml) => xml,
            Err(err) => {
                let err = ExploreError::device("capture_hierarchy", &err);
                self.log(Severity::Warn, EventKind::DeviceActionFailed, err.to_string());
                return None;
            }
        };
        if self.session.is_stopped() {
            return None;
        }
        let elements = match parse_hierarchy(&xml) {
            Ok(elements) => elements,
            Err(err) => {
                let err = ExploreError::device("parse_hierarchy", &err);
                self.log(Severity::Warn, EventKind::DeviceActionFailed, err.to_string());
                return None;
            }
        };

        let screenshot = match self.driver.capture_screenshot() {
            Ok(screenshot) => screenshot,
            Err(err) => {
                let err = ExploreError::device("capture_screenshot", &err);
                self.log(Severity::Warn, EventKind::DeviceActionFailed, err.to_string());
                Screenshot::default()
            }
        };
        let screenshot_fingerprint = if screenshot.png.is_empty() {
            String::new()
        } else {
            content_hash(&screenshot.png)
        };

        let activity = activity.unwrap_or_default();
        let observation = Observation {
            fingerprint: screen_fingerprint(&activity, &elements),
            activity,
            screenshot_fingerprint,
            elements,
        };
        Some((observation, screenshot))
    }

    fn settle(&self) {
        let delay = self.session.settings.settle_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn log(&mut self, severity: Severity, kind: EventKind, message: impl Into<String>) {
        let event = LogEvent::new(severity, kind, message);
        debug!(kind = ?event.kind, "{}", event.message);
        self.observer.on_log(&event);
    }
}

fn describe(element: &Element) -> String {
    match element.label() {
        Some(label) => format!("{} \"{label}\"", element.short_class()),
        None => element.short_class().to_string(),
    }
}
