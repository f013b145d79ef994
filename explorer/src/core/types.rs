//! Shared data model for screens, elements, and the action history.
//!
//! Screens and elements are compared by fingerprint only. Everything else they
//! carry is context for ranking, progress inference, and reporting.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fingerprint::element_fingerprint;

/// Screen-space rectangle in pixels, as reported by the view hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Parse the uiautomator `"[left,top][right,bottom]"` notation.
    pub fn parse(raw: &str) -> Option<Self> {
        let inner = raw.trim().strip_prefix('[')?.strip_suffix(']')?;
        let (first, second) = inner.split_once("][")?;
        let (left, top) = first.split_once(',')?;
        let (right, bottom) = second.split_once(',')?;
        Some(Self {
            left: left.trim().parse().ok()?,
            top: top.trim().parse().ok()?,
            right: right.trim().parse().ok()?,
            bottom: bottom.trim().parse().ok()?,
        })
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn center(&self) -> (i32, i32) {
        (
            self.left + self.width() / 2,
            self.top + self.height() / 2,
        )
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    /// Grow by `padding` on every side, clamped to a `max_width` x `max_height` screen.
    pub fn padded(&self, padding: i32, max_width: i32, max_height: i32) -> Self {
        Self {
            left: (self.left - padding).max(0),
            top: (self.top - padding).max(0),
            right: (self.right + padding).min(max_width),
            bottom: (self.bottom + padding).min(max_height),
        }
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{}][{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// One control on a screen. Recomputed on every observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub fingerprint: String,
    pub bounds: Bounds,
    pub class_name: String,
    pub text: Option<String>,
    pub resource_id: Option<String>,
    /// Accessibility description. Context only; not part of the fingerprint.
    pub content_desc: Option<String>,
    pub interactable: bool,
}

impl Element {
    pub fn new(
        bounds: Bounds,
        class_name: impl Into<String>,
        text: Option<String>,
        resource_id: Option<String>,
        interactable: bool,
    ) -> Self {
        let class_name = class_name.into();
        let text = text.filter(|t| !t.trim().is_empty());
        let resource_id = resource_id.filter(|r| !r.trim().is_empty());
        let fingerprint =
            element_fingerprint(&bounds, &class_name, text.as_deref(), resource_id.as_deref());
        Self {
            fingerprint,
            bounds,
            class_name,
            text,
            resource_id,
            content_desc: None,
            interactable,
        }
    }

    pub fn with_content_desc(mut self, desc: Option<String>) -> Self {
        self.content_desc = desc.filter(|d| !d.trim().is_empty());
        self
    }

    /// Short class name (`android.widget.Button` -> `Button`).
    pub fn short_class(&self) -> &str {
        self.class_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.class_name)
    }

    /// Human-readable label: text, then content description, then resource id.
    pub fn label(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or(self.content_desc.as_deref())
            .or(self.resource_id.as_deref())
    }
}

/// Captured screen image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Sequential identifier assigned by the fingerprint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(pub u32);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A distinct screen of the target application. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenState {
    pub id: StateId,
    pub fingerprint: String,
    pub activity: String,
    pub screenshot_fingerprint: String,
    pub elements: Vec<Element>,
    pub parent: Option<StateId>,
}

impl ScreenState {
    /// Activity name without the package (`com.app/.LoginActivity` -> `LoginActivity`).
    pub fn activity_name(&self) -> &str {
        short_activity(&self.activity)
    }
}

/// Strip the package and leading dots from an activity component name.
pub fn short_activity(activity: &str) -> &str {
    let component = activity.rsplit('/').next().unwrap_or(activity);
    component.rsplit('.').next().unwrap_or(component)
}

/// Package portion of an activity component name.
pub fn activity_package(activity: &str) -> &str {
    activity.split('/').next().unwrap_or(activity).trim()
}

/// Everything the engine learned about the current screen before identity is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub fingerprint: String,
    pub activity: String,
    pub screenshot_fingerprint: String,
    pub elements: Vec<Element>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Visit,
    Click,
    Revisit,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Visit => "visit",
            ActionKind::Click => "click",
            ActionKind::Revisit => "revisit",
        }
    }
}

/// Append-only session log entry. The sole input to progress and cycle tracking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: ActionKind,
    pub state: Arc<ScreenState>,
    pub element: Option<Element>,
    /// Recursion depth the action was taken at (root screen = 0).
    pub depth: usize,
    pub result: String,
}

impl ActionHistoryEntry {
    pub fn new(
        action: ActionKind,
        state: Arc<ScreenState>,
        element: Option<Element>,
        depth: usize,
        result: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            state,
            element,
            depth,
            result: result.into(),
        }
    }
}

/// Candidate ordering policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationMode {
    #[default]
    Sequential,
    Reverse,
    OracleGuided,
}

impl ExplorationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExplorationMode::Sequential => "sequential",
            ExplorationMode::Reverse => "reverse",
            ExplorationMode::OracleGuided => "oracle_guided",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_parse_uiautomator_notation() {
        let bounds = Bounds::parse("[0,210][1080,342]").expect("bounds");
        assert_eq!(bounds, Bounds::new(0, 210, 1080, 342));
        assert_eq!(bounds.center(), (540, 276));
        assert_eq!(bounds.to_string(), "[0,210][1080,342]");
    }

    #[test]
    fn bounds_parse_rejects_garbage() {
        assert_eq!(Bounds::parse(""), None);
        assert_eq!(Bounds::parse("[0,0]"), None);
        assert_eq!(Bounds::parse("[a,0][1,1]"), None);
    }

    #[test]
    fn padded_bounds_clamp_to_screen() {
        let bounds = Bounds::new(10, 5, 1070, 100);
        assert_eq!(bounds.padded(20, 1080, 1920), Bounds::new(0, 0, 1080, 120));
    }

    #[test]
    fn element_blank_text_is_dropped() {
        let element = Element::new(
            Bounds::new(0, 0, 10, 10),
            "android.widget.Button",
            Some("  ".to_string()),
            Some(String::new()),
            true,
        );
        assert_eq!(element.text, None);
        assert_eq!(element.resource_id, None);
        assert_eq!(element.short_class(), "Button");
    }

    #[test]
    fn activity_helpers_split_component_names() {
        assert_eq!(short_activity("com.app/.auth.LoginActivity"), "LoginActivity");
        assert_eq!(activity_package("com.app/.auth.LoginActivity"), "com.app");
        assert_eq!(activity_package("com.app"), "com.app");
    }
}
