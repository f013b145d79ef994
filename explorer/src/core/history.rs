//! Summaries of the action history for the decision oracle.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::core::types::{ActionHistoryEntry, ActionKind};

const TOP_N: usize = 3;

/// Numeric digest of a session's history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistorySummary {
    pub states_visited: usize,
    pub elements_clicked: usize,
    pub revisits: usize,
    /// Most frequent activities across all entries, with counts.
    pub top_activities: Vec<(String, usize)>,
    /// Most frequently clicked element classes, with counts.
    pub top_clicked_classes: Vec<(String, usize)>,
}

impl HistorySummary {
    pub fn from_history(history: &[ActionHistoryEntry]) -> Self {
        let mut visited = HashSet::new();
        let mut activities: HashMap<&str, usize> = HashMap::new();
        let mut classes: HashMap<&str, usize> = HashMap::new();
        let mut elements_clicked = 0;
        let mut revisits = 0;

        for entry in history {
            *activities.entry(entry.state.activity_name()).or_default() += 1;
            match entry.action {
                ActionKind::Visit => {
                    visited.insert(entry.state.id);
                }
                ActionKind::Revisit => revisits += 1,
                ActionKind::Click => {
                    elements_clicked += 1;
                    if let Some(element) = &entry.element {
                        *classes.entry(element.short_class()).or_default() += 1;
                    }
                }
            }
        }

        Self {
            states_visited: visited.len(),
            elements_clicked,
            revisits,
            top_activities: top_counts(activities),
            top_clicked_classes: top_counts(classes),
        }
    }
}

/// Highest counts first; ties broken by name for stable output.
fn top_counts(counts: HashMap<&str, usize>) -> Vec<(String, usize)> {
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_N);
    ranked
}

/// Render one history entry as a short single line.
pub fn render_entry(entry: &ActionHistoryEntry) -> String {
    let mut line = format!(
        "[{}] {} ({})",
        entry.action.as_str(),
        entry.state.activity_name(),
        entry.state.id
    );
    if let Some(element) = &entry.element {
        line.push_str(&format!(" > {}", element.short_class()));
        if let Some(label) = element.label() {
            line.push_str(&format!(" \"{label}\""));
        }
    }
    if !entry.result.is_empty() {
        line.push_str(&format!(": {}", entry.result));
    }
    line
}

/// The last `limit` entries rendered as lines, oldest first.
pub fn recent_lines(history: &[ActionHistoryEntry], limit: usize) -> Vec<String> {
    let start = history.len().saturating_sub(limit);
    history[start..].iter().map(render_entry).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Bounds, Element, ScreenState, StateId};
    use std::sync::Arc;

    fn state(id: u32, activity: &str) -> Arc<ScreenState> {
        Arc::new(ScreenState {
            id: StateId(id),
            fingerprint: format!("fp{id}"),
            activity: activity.to_string(),
            screenshot_fingerprint: String::new(),
            elements: Vec::new(),
            parent: None,
        })
    }

    fn button(text: &str) -> Element {
        Element::new(
            Bounds::new(0, 0, 10, 10),
            "android.widget.Button",
            Some(text.to_string()),
            None,
            true,
        )
    }

    fn sample() -> Vec<ActionHistoryEntry> {
        let main = state(0, "com.app/.MainActivity");
        let detail = state(1, "com.app/.DetailActivity");
        vec![
            ActionHistoryEntry::new(ActionKind::Visit, Arc::clone(&main), None, 0, "new state"),
            ActionHistoryEntry::new(
                ActionKind::Click,
                Arc::clone(&main),
                Some(button("Open")),
                0,
                "tapped",
            ),
            ActionHistoryEntry::new(ActionKind::Visit, Arc::clone(&detail), None, 1, "new state"),
            ActionHistoryEntry::new(ActionKind::Revisit, main, None, 1, "known state"),
        ]
    }

    #[test]
    fn summary_counts_visits_clicks_and_activities() {
        let summary = HistorySummary::from_history(&sample());
        assert_eq!(summary.states_visited, 2);
        assert_eq!(summary.elements_clicked, 1);
        assert_eq!(summary.revisits, 1);
        assert_eq!(
            summary.top_activities[0],
            ("MainActivity".to_string(), 3)
        );
        assert_eq!(summary.top_clicked_classes, vec![("Button".to_string(), 1)]);
    }

    #[test]
    fn render_entry_includes_element_label() {
        let history = sample();
        assert_eq!(
            render_entry(&history[1]),
            "[click] MainActivity (s0) > Button \"Open\": tapped"
        );
    }

    #[test]
    fn recent_lines_keeps_the_tail() {
        let lines = recent_lines(&sample(), 2);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[visit] DetailActivity"));
        assert!(lines[1].starts_with("[revisit] MainActivity"));
    }
}
