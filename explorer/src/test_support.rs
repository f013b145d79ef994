//! Test-only fakes: a scripted app behind [`DeviceDriver`], a scripted oracle,
//! scripted vision and a recording observer.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use anyhow::{Result, anyhow};

use crate::core::prioritizer::{CandidateScorer, ScoredCandidates, ScoringContext};
use crate::core::types::{Bounds, Element, ScreenState, Screenshot, StateId};
use crate::error::ExploreError;
use crate::explore::StopHandle;
use crate::io::device::DeviceDriver;
use crate::io::oracle::{Oracle, OracleRequest};
use crate::io::vision::{ElementCrop, ElementVision};
use crate::session::{EventKind, LogEvent, Observer, Progress};

const BUTTON_CLASS: &str = "android.widget.Button";

/// Bounds of the `slot`-th button on a scripted screen.
pub fn button_bounds(slot: usize) -> Bounds {
    let top = slot as i32 * 100;
    Bounds::new(0, top, 500, top + 80)
}

/// The element a [`ScriptedApp`] renders for `label` in `slot`.
pub fn button(slot: usize, label: &str) -> Element {
    Element::new(
        button_bounds(slot),
        BUTTON_CLASS,
        Some(label.to_string()),
        None,
        true,
    )
}

/// One scripted screen: an activity and buttons leading to other screens.
#[derive(Debug, Clone)]
pub struct Screen {
    pub activity: String,
    /// `(label, target screen index)`; buttons are laid out top to bottom.
    pub buttons: Vec<(String, usize)>,
}

impl Screen {
    /// Screen of the `com.example` app.
    pub fn new(activity: &str, buttons: &[(&str, usize)]) -> Self {
        Self::in_package("com.example", activity, buttons)
    }

    pub fn in_package(package: &str, activity: &str, buttons: &[(&str, usize)]) -> Self {
        Self {
            activity: format!("{package}/.{activity}"),
            buttons: buttons
                .iter()
                .map(|(label, target)| (label.to_string(), *target))
                .collect(),
        }
    }
}

/// Device calls observed by a [`ScriptedApp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CurrentActivity,
    CaptureHierarchy,
    CaptureScreenshot,
    Tap(i32, i32),
    NavigateBack,
    LaunchApp(String),
}

/// In-memory app: screen 0 is the launch screen, taps push, back pops.
#[derive(Debug)]
pub struct ScriptedApp {
    app_id: String,
    screens: Vec<Screen>,
    stack: RefCell<Vec<usize>>,
    calls: RefCell<Vec<Call>>,
    activity_overrides: RefCell<VecDeque<String>>,
    failing_labels: RefCell<Vec<String>>,
    screenshot_fails: Cell<bool>,
}

impl ScriptedApp {
    pub fn new(app_id: &str, screens: Vec<Screen>) -> Self {
        Self {
            app_id: app_id.to_string(),
            screens,
            stack: RefCell::new(vec![0]),
            calls: RefCell::new(Vec::new()),
            activity_overrides: RefCell::new(VecDeque::new()),
            failing_labels: RefCell::new(Vec::new()),
            screenshot_fails: Cell::new(false),
        }
    }

    /// `n` screens: a hub with one button per leaf screen.
    pub fn hub(n: usize) -> Self {
        let labels: Vec<String> = (1..n).map(|i| format!("Open {i}")).collect();
        let buttons: Vec<(&str, usize)> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.as_str(), i + 1))
            .collect();
        let mut screens = vec![Screen::new("Hub", &buttons)];
        screens.extend((1..n).map(|i| Screen::new(&format!("Leaf{i}"), &[])));
        Self::new("com.example", screens)
    }

    /// Answer the next `current_activity` calls with these values, in order.
    pub fn script_activities<I, S>(&self, activities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activity_overrides
            .borrow_mut()
            .extend(activities.into_iter().map(Into::into));
    }

    /// Make taps on buttons labelled `label` fail.
    pub fn fail_taps_on(&self, label: &str) {
        self.failing_labels.borrow_mut().push(label.to_string());
    }

    pub fn fail_screenshots(&self) {
        self.screenshot_fails.set(true);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn launches(&self) -> usize {
        self.count(|c| matches!(c, Call::LaunchApp(_)))
    }

    pub fn taps(&self) -> usize {
        self.count(|c| matches!(c, Call::Tap(..)))
    }

    pub fn back_presses(&self) -> usize {
        self.count(|c| *c == Call::NavigateBack)
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| pred(c)).count()
    }

    fn current(&self) -> usize {
        self.stack.borrow().last().copied().unwrap_or(0)
    }

    fn screen(&self) -> &Screen {
        &self.screens[self.current()]
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn render(&self) -> String {
        let screen = self.screen();
        let package = screen.activity.split('/').next().unwrap_or_default();
        let mut xml = format!(
            "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>\
             <hierarchy rotation=\"0\">\
             <node index=\"0\" text=\"\" resource-id=\"\" class=\"android.widget.FrameLayout\" \
             package=\"{package}\" content-desc=\"\" clickable=\"false\" enabled=\"true\" \
             bounds=\"[0,0][1080,1920]\">"
        );
        for (slot, (label, _)) in screen.buttons.iter().enumerate() {
            xml.push_str(&format!(
                "<node index=\"{slot}\" text=\"{}\" resource-id=\"\" class=\"{BUTTON_CLASS}\" \
                 package=\"{package}\" content-desc=\"\" clickable=\"true\" enabled=\"true\" \
                 bounds=\"{}\" />",
                escape(label),
                button_bounds(slot)
            ));
        }
        xml.push_str("</node></hierarchy>");
        xml
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl DeviceDriver for ScriptedApp {
    fn current_activity(&self) -> Result<String> {
        self.record(Call::CurrentActivity);
        if let Some(activity) = self.activity_overrides.borrow_mut().pop_front() {
            return Ok(activity);
        }
        Ok(self.screen().activity.clone())
    }

    fn capture_hierarchy(&self) -> Result<String> {
        self.record(Call::CaptureHierarchy);
        Ok(self.render())
    }

    fn capture_screenshot(&self) -> Result<Screenshot> {
        self.record(Call::CaptureScreenshot);
        if self.screenshot_fails.get() {
            return Err(anyhow!("screencap failed"));
        }
        Ok(Screenshot {
            png: format!("screen-{}", self.current()).into_bytes(),
            width: 1080,
            height: 1920,
        })
    }

    fn tap(&self, x: i32, y: i32) -> Result<()> {
        self.record(Call::Tap(x, y));
        let hit = self
            .screen()
            .buttons
            .iter()
            .enumerate()
            .find(|(slot, _)| button_bounds(*slot).contains(x, y))
            .map(|(_, (label, target))| (label.clone(), *target));
        let Some((label, target)) = hit else {
            return Ok(());
        };
        if self.failing_labels.borrow().contains(&label) {
            return Err(anyhow!("tap on {label} failed"));
        }
        if target != self.current() {
            self.stack.borrow_mut().push(target);
        }
        Ok(())
    }

    fn navigate_back(&self) -> Result<()> {
        self.record(Call::NavigateBack);
        let mut stack = self.stack.borrow_mut();
        if stack.len() > 1 {
            stack.pop();
        }
        Ok(())
    }

    fn launch_app(&self, app_id: &str) -> Result<()> {
        self.record(Call::LaunchApp(app_id.to_string()));
        if app_id == self.app_id {
            *self.stack.borrow_mut() = vec![0];
        }
        Ok(())
    }
}

/// Oracle replaying canned answers; the last one repeats.
#[derive(Debug)]
pub struct ScriptedOracle {
    answers: RefCell<VecDeque<Result<String, String>>>,
    last: RefCell<Result<String, String>>,
    requests: RefCell<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn answering<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: RefCell::new(answers.into_iter().map(|a| Ok(a.into())).collect()),
            last: RefCell::new(Ok("[]".to_string())),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            answers: RefCell::new(VecDeque::new()),
            last: RefCell::new(Err(message.to_string())),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.borrow().clone()
    }
}

impl Oracle for ScriptedOracle {
    fn rank(&self, request: &OracleRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        if let Some(answer) = self.answers.borrow_mut().pop_front() {
            *self.last.borrow_mut() = answer;
        }
        self.last.borrow().clone().map_err(|message| anyhow!(message))
    }
}

/// Vision returning a fixed crop and recording requested regions.
#[derive(Debug)]
pub struct ScriptedVision {
    pub image: Vec<u8>,
    pub ocr_text: Option<String>,
    pub regions: RefCell<Vec<Bounds>>,
}

impl Default for ScriptedVision {
    fn default() -> Self {
        Self {
            image: b"crop".to_vec(),
            ocr_text: None,
            regions: RefCell::new(Vec::new()),
        }
    }
}

impl ElementVision for ScriptedVision {
    fn inspect(&self, _screenshot: &Screenshot, region: Bounds) -> Result<ElementCrop> {
        self.regions.borrow_mut().push(region);
        Ok(ElementCrop {
            image: Some(self.image.clone()),
            ocr_text: self.ocr_text.clone(),
        })
    }
}

/// Scorer for non-oracle modes, where it must never be consulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unscored;

impl CandidateScorer for Unscored {
    fn score(&mut self, _candidates: &[Element], _context: &ScoringContext<'_>) -> ScoredCandidates {
        panic!("scorer consulted outside oracle-guided mode");
    }
}

/// Observer capturing every callback in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub new_states: Vec<StateId>,
    pub progress: Vec<Progress>,
    pub events: Vec<LogEvent>,
    pub errors: Vec<ExploreError>,
    /// Callback names in arrival order (`new_state`, `complete`, `error`, `stop`).
    pub sequence: Vec<&'static str>,
    /// Trigger `stop` once this many new states were seen.
    pub stop_after: Option<(usize, StopHandle)>,
}

impl RecordingObserver {
    pub fn stopping_after(states: usize, handle: StopHandle) -> Self {
        Self {
            stop_after: Some((states, handle)),
            ..Self::default()
        }
    }

    pub fn events_of(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

impl Observer for RecordingObserver {
    fn on_new_state(&mut self, state: &ScreenState) {
        self.new_states.push(state.id);
        self.sequence.push("new_state");
        if let Some((limit, handle)) = &self.stop_after
            && self.new_states.len() >= *limit
        {
            handle.stop();
        }
    }

    fn on_progress(&mut self, progress: Progress) {
        self.progress.push(progress);
    }

    fn on_log(&mut self, event: &LogEvent) {
        self.events.push(event.clone());
    }

    fn on_complete(&mut self) {
        self.sequence.push("complete");
    }

    fn on_error(&mut self, err: &ExploreError) {
        self.errors.push(err.clone());
        self.sequence.push("error");
    }

    fn on_stop(&mut self) {
        self.sequence.push("stop");
    }
}
