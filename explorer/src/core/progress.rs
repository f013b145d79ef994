//! Goal progress inference from the action history.
//!
//! A goal prompt may carry a bracketed title and a numbered list of steps. The
//! current step is recomputed from the full history on every call rather than
//! tracked incrementally, so it can move backwards when early actions end up
//! outscoring later ones.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::{ActionHistoryEntry, ActionKind};

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]\n]+)\]").unwrap());
static STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+(.+?)\s*$").unwrap());

const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "also", "before", "click", "each", "enter", "from", "have", "into",
    "make", "once", "open", "page", "press", "screen", "select", "should", "that", "their",
    "them", "then", "there", "these", "they", "this", "touch", "type", "until", "what", "when",
    "where", "which", "will", "with", "your",
];

/// Actions at the tail of the history that get the recency boost.
const RECENT_ACTIONS: usize = 3;
const RECENCY_BOOST: f64 = 1.5;
const SEQUENCE_BONUS: f64 = 0.5;

/// Steps parsed out of a free-text goal prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalSteps {
    /// Bracketed goal type, e.g. `Login Flow` for `[Login Flow]`.
    pub title: Option<String>,
    pub steps: Vec<String>,
}

/// Parse a bracketed title and a numbered list (`1. ...`, `2) ...`).
///
/// Returns zero steps when no numbered list is present; callers then treat the
/// whole prompt as a single open-ended goal.
pub fn extract_steps(goal_prompt: &str) -> GoalSteps {
    let title = TITLE_RE
        .captures(goal_prompt)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty());
    let steps = STEP_RE
        .captures_iter(goal_prompt)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    GoalSteps { title, steps }
}

/// Lowercase keywords of a step: longer than 3 chars, stop words removed, deduplicated.
pub fn keywords(step: &str) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();
    for word in step
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
    {
        if word.chars().count() <= 3 || STOP_WORDS.contains(&word.as_str()) {
            continue;
        }
        if !words.contains(&word) {
            words.push(word);
        }
    }
    words
}

/// Accumulated keyword-match scores per step.
#[derive(Debug, Clone, PartialEq)]
struct StepScores {
    scores: Vec<f64>,
    /// Winner after the last matching entry, before the forced-progress guards.
    leader: usize,
    /// Click/visit entries scanned.
    actions: usize,
}

/// Infer the index of the step the session is currently working on.
pub fn current_step(history: &[ActionHistoryEntry], steps: &[String]) -> usize {
    if steps.is_empty() {
        return 0;
    }
    let scored = score_steps(history, steps);
    with_forced_progress(scored.leader, scored.actions, steps.len())
}

fn score_steps(history: &[ActionHistoryEntry], steps: &[String]) -> StepScores {
    let step_keywords: Vec<Vec<String>> = steps.iter().map(|s| keywords(s)).collect();
    let actions: Vec<&ActionHistoryEntry> = history
        .iter()
        .filter(|entry| matches!(entry.action, ActionKind::Click | ActionKind::Visit))
        .collect();
    let total = actions.len();
    let step_count = steps.len();

    let mut scores = vec![0.0f64; step_count];
    let mut current = 0usize;
    for (idx, entry) in actions.iter().enumerate() {
        let haystack = entry_haystack(entry);
        let weight = entry_weight(idx, total, step_count);
        let mut matched = false;
        for (step, words) in step_keywords.iter().enumerate() {
            let hits = words
                .iter()
                .filter(|word| haystack.contains(word.as_str()))
                .count();
            if hits == 0 {
                continue;
            }
            let diminishing = 1.0 / (1.0 + (1.0 + scores[step]).ln());
            scores[step] += hits as f64 * weight * diminishing;
            matched = true;
        }
        if matched {
            current = winning_step(&scores, current);
        }
    }
    StepScores {
        scores,
        leader: current,
        actions: total,
    }
}

/// Do not let a session sit on the first steps forever.
fn with_forced_progress(mut current: usize, total: usize, step_count: usize) -> usize {
    if total > 3 * step_count && current == 0 && step_count > 1 {
        current = 1;
    }
    if total > 15 && current < 2 && step_count > 2 {
        current = 2;
    }
    current.min(step_count - 1)
}

fn entry_haystack(entry: &ActionHistoryEntry) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(element) = &entry.element {
        parts.extend(element.text.as_deref());
        parts.extend(element.content_desc.as_deref());
        parts.extend(element.resource_id.as_deref());
    }
    parts.push(&entry.state.activity);
    parts.join(" ").to_lowercase()
}

fn entry_weight(idx: usize, total: usize, step_count: usize) -> f64 {
    let mut weight = 1.0;
    if total > 5 * step_count {
        // Linear ramp from ~0.5 for the oldest action to 1.0 for the newest.
        weight *= 0.5 + 0.5 * (idx + 1) as f64 / total as f64;
    }
    if idx + RECENT_ACTIONS >= total {
        weight *= RECENCY_BOOST;
    }
    weight
}

fn winning_step(scores: &[f64], previous: usize) -> usize {
    let mut best = previous;
    let mut best_score = f64::MIN;
    for (idx, score) in scores.iter().enumerate() {
        if *score <= 0.0 {
            continue;
        }
        let bonus = if idx == previous + 1 { SEQUENCE_BONUS } else { 0.0 };
        if score + bonus > best_score {
            best = idx;
            best_score = score + bonus;
        }
    }
    best
}

/// Derived progress snapshot. Recomputed, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalProgress {
    pub steps: Vec<String>,
    pub current_step: usize,
    /// Number of click/visit entries the inference was based on.
    pub actions: usize,
    /// The final step leads on its own matches, not through a forced guard.
    pub completed: bool,
}

impl GoalProgress {
    pub fn from_history(steps: Vec<String>, history: &[ActionHistoryEntry]) -> Self {
        if steps.is_empty() {
            let actions = history
                .iter()
                .filter(|entry| matches!(entry.action, ActionKind::Click | ActionKind::Visit))
                .count();
            return Self {
                steps,
                current_step: 0,
                actions,
                completed: false,
            };
        }
        let scored = score_steps(history, &steps);
        let last = steps.len() - 1;
        let current_step = with_forced_progress(scored.leader, scored.actions, steps.len());
        Self {
            completed: scored.leader == last && scored.scores[last] > 0.0,
            current_step,
            actions: scored.actions,
            steps,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.steps.get(self.current_step).map(String::as_str)
    }
}

/// Render up to three human-readable lines about where the session stands.
pub fn next_step_hints(progress: &GoalProgress) -> Vec<String> {
    let steps = &progress.steps;
    if steps.is_empty() {
        return Vec::new();
    }
    if progress.actions == 0 {
        return vec![format!("Start by {}", lowercase_first(&steps[0]))];
    }
    let total = steps.len();
    if progress.completed {
        return vec![
            format!("All {total} steps appear done; goal reached"),
            "Prefer unexplored screens over repeating the final step".to_string(),
        ];
    }

    let current = progress.current_step.min(total - 1);
    let mut hints = vec![format!(
        "Current step ({}/{}): {}",
        current + 1,
        total,
        steps[current]
    )];
    match steps.get(current + 1) {
        Some(next) => hints.push(format!("Next step: {next}")),
        None => hints.push("This is the final step; completing it finishes the goal".to_string()),
    }
    if let Some(after) = steps.get(current + 2) {
        hints.push(format!("After that: {after}"));
    }
    hints
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Bounds, Element, ScreenState, StateId};
    use std::sync::Arc;

    const LOGIN: &str = "[Login Flow]\n1. Tap email field\n2. Tap password field\n3. Tap submit";

    fn state(activity: &str) -> Arc<ScreenState> {
        Arc::new(ScreenState {
            id: StateId(0),
            fingerprint: "fp".to_string(),
            activity: activity.to_string(),
            screenshot_fingerprint: String::new(),
            elements: Vec::new(),
            parent: None,
        })
    }

    fn click(text: &str) -> ActionHistoryEntry {
        let element = Element::new(
            Bounds::new(0, 0, 10, 10),
            "android.widget.EditText",
            Some(text.to_string()),
            None,
            true,
        );
        ActionHistoryEntry::new(
            ActionKind::Click,
            state("com.app/.LoginActivity"),
            Some(element),
            0,
            "tapped",
        )
    }

    fn steps(prompt: &str) -> Vec<String> {
        extract_steps(prompt).steps
    }

    #[test]
    fn login_prompt_with_empty_history() {
        let parsed = extract_steps(LOGIN);
        assert_eq!(parsed.title.as_deref(), Some("Login Flow"));
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(current_step(&[], &parsed.steps), 0);

        let progress = GoalProgress::from_history(parsed.steps, &[]);
        assert_eq!(next_step_hints(&progress), vec!["Start by tap email field"]);
    }

    #[test]
    fn prompt_without_numbered_list_has_no_steps() {
        let parsed = extract_steps("Find the settings page and turn on dark mode");
        assert_eq!(parsed.title, None);
        assert!(parsed.steps.is_empty());
        let progress = GoalProgress::from_history(parsed.steps, &[click("Settings")]);
        assert!(next_step_hints(&progress).is_empty());
    }

    #[test]
    fn keywords_skip_short_and_stop_words() {
        assert_eq!(keywords("Tap the email field"), vec!["email", "field"]);
        assert_eq!(keywords("Open your profile, then Profile"), vec!["profile"]);
    }

    #[test]
    fn matching_clicks_advance_in_sequence() {
        let steps = steps(LOGIN);
        assert_eq!(current_step(&[click("Email")], &steps), 0);
        assert_eq!(current_step(&[click("Email"), click("Password")], &steps), 1);
        assert_eq!(
            current_step(&[click("Email"), click("Password"), click("Submit")], &steps),
            2
        );
    }

    #[test]
    fn unrelated_history_forces_second_step() {
        let steps = steps(LOGIN);
        let history: Vec<_> = (0..10).map(|i| click(&format!("Item {i}"))).collect();
        assert_eq!(current_step(&history, &steps), 1);
    }

    #[test]
    fn long_unrelated_history_forces_third_step() {
        let steps = steps(LOGIN);
        let history: Vec<_> = (0..16).map(|i| click(&format!("Item {i}"))).collect();
        assert_eq!(current_step(&history, &steps), 2);
    }

    #[test]
    fn revisits_are_ignored() {
        let steps = steps(LOGIN);
        let revisit = ActionHistoryEntry::new(
            ActionKind::Revisit,
            state("com.app/.PasswordActivity"),
            None,
            0,
            "known",
        );
        assert_eq!(current_step(&[click("Email"), revisit], &steps), 0);
    }

    #[test]
    fn decay_ramps_down_old_actions_only_in_long_histories() {
        // 3 steps: decay starts once history exceeds 15 actions.
        assert_eq!(entry_weight(0, 15, 3), 1.0);
        let oldest = entry_weight(0, 16, 3);
        let middle = entry_weight(8, 16, 3);
        assert!(oldest < middle && middle < 1.0, "{oldest} {middle}");
        assert_eq!(entry_weight(15, 16, 3), RECENCY_BOOST);
    }

    #[test]
    fn recent_matches_outscore_repeated_early_ones_in_long_histories() {
        let steps = steps(
            "1. Tap email field\n2. Tap password field\n3. Tap submit\n4. Confirm receipt",
        );
        let mut history: Vec<_> = (0..3).map(|_| click("Email")).collect();
        history.extend((0..16).map(|i| click(&format!("Item {i}"))));
        history.extend((0..2).map(|_| click("Receipt")));
        assert_eq!(history.len(), 21);

        let scored = score_steps(&history, &steps);
        assert!(scored.scores[3] > scored.scores[0], "{:?}", scored.scores);
        assert_eq!(current_step(&history, &steps), 3);
    }

    #[test]
    fn repeated_hits_on_one_step_grow_sublinearly() {
        let steps = steps(LOGIN);
        let history: Vec<_> = (0..6).map(|_| click("Email")).collect();
        let scored = score_steps(&history, &steps);
        // Three plain hits plus three recency-boosted ones.
        let linear = 3.0 + 3.0 * RECENCY_BOOST;
        assert!(scored.scores[0] < 0.6 * linear, "{:?}", scored.scores);

        let fewer = score_steps(&history[..3], &steps);
        assert!(scored.scores[0] > fewer.scores[0]);
    }

    #[test]
    fn spread_matches_beat_one_monopolizing_step() {
        // Unweighted, three Email hits tie two boosted Password hits plus the
        // sequence bonus, and a tie keeps the earlier step.
        let steps = steps(LOGIN);
        let history = vec![
            click("Email"),
            click("Email"),
            click("Email"),
            click("Password"),
            click("Password"),
        ];
        assert_eq!(current_step(&history, &steps), 1);
    }

    #[test]
    fn acting_on_the_final_step_completes_the_goal() {
        let steps = steps(LOGIN);
        let history = vec![click("Email"), click("Password"), click("Submit")];
        let progress = GoalProgress::from_history(steps.clone(), &history);
        assert!(progress.completed);
        assert_eq!(progress.current_step, 2);
        let hints = next_step_hints(&progress);
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0], "All 3 steps appear done; goal reached");

        // Forced onto the last step without any match is not completion.
        let idle: Vec<_> = (0..16).map(|i| click(&format!("Item {i}"))).collect();
        let forced = GoalProgress::from_history(steps, &idle);
        assert_eq!(forced.current_step, 2);
        assert!(!forced.completed);
    }

    #[test]
    fn hints_cover_current_next_and_after() {
        let progress = GoalProgress {
            steps: steps(LOGIN),
            current_step: 0,
            actions: 1,
            completed: false,
        };
        assert_eq!(
            next_step_hints(&progress),
            vec![
                "Current step (1/3): Tap email field",
                "Next step: Tap password field",
                "After that: Tap submit",
            ]
        );
    }

    #[test]
    fn hints_on_final_step_announce_completion() {
        let progress = GoalProgress {
            steps: steps(LOGIN),
            current_step: 2,
            actions: 7,
            completed: false,
        };
        let hints = next_step_hints(&progress);
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0], "Current step (3/3): Tap submit");
        assert!(hints[1].contains("final step"));
    }
}
