//! Oracle prompt rendering within a byte budget.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::history::HistorySummary;
use crate::io::oracle::ElementContext;

const ORACLE_TEMPLATE: &str = include_str!("prompts/oracle.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 4] = ["history", "summary", "recent", "progress"];

/// All inputs needed to render an oracle prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub goal: Option<&'a str>,
    pub hints: &'a [String],
    pub summary: &'a HistorySummary,
    /// Rendered history lines, oldest first.
    pub history: &'a [String],
    /// Recently clicked fingerprints, most recent first.
    pub recent: &'a [String],
    pub candidates: &'a [ElementContext],
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Renders the ranking prompt, dropping less critical sections to fit the budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let rendered = render(input)?;
        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

fn render(input: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("oracle", ORACLE_TEMPLATE)
        .context("load oracle template")?;
    let template = env.get_template("oracle")?;
    let rendered = template
        .render(context! {
            goal => input.goal.map(str::trim).filter(|g| !g.is_empty()),
            hints => input.hints,
            summary => input.summary,
            history => input.history,
            recent => input.recent,
            candidates => input.candidates,
        })
        .context("render oracle prompt")?;
    Ok(rendered)
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total - last.content.len());
    let before_len = last.content.len();
    let marker = "\n[truncated]";
    let keep = floor_char_boundary(&last.content, allowed.saturating_sub(marker.len()));
    last.content.truncate(keep);
    if allowed > marker.len() {
        last.content.push_str(marker);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Bounds;

    fn candidate(index: usize, text: &str) -> ElementContext {
        ElementContext {
            index,
            fingerprint: format!("fp{index}"),
            class_name: "android.widget.Button".to_string(),
            text: Some(text.to_string()),
            resource_id: None,
            content_desc: None,
            bounds: Bounds::new(0, 0, 100, 40),
            crop_png_base64: None,
            ocr_text: Some("OCR".to_string()),
        }
    }

    fn summary() -> HistorySummary {
        HistorySummary {
            states_visited: 3,
            elements_clicked: 2,
            revisits: 1,
            top_activities: vec![("LoginActivity".to_string(), 4)],
            top_clicked_classes: vec![("Button".to_string(), 2)],
        }
    }

    fn build(budget: usize, history: &[String]) -> String {
        let hints = vec!["Current step (1/2): Tap email".to_string()];
        let recent = vec!["fp9".to_string()];
        let candidates = vec![candidate(0, "Email"), candidate(1, "Password")];
        let summary = summary();
        PromptBuilder::new(budget)
            .build(&PromptInputs {
                goal: Some("[Login]\n1. Tap email\n2. Tap password"),
                hints: &hints,
                summary: &summary,
                history,
                recent: &recent,
                candidates: &candidates,
            })
            .expect("build prompt")
    }

    #[test]
    fn sections_render_in_order() {
        let prompt = build(100_000, &["[click] LoginActivity (s0) > Button".to_string()]);
        let positions: Vec<usize> = [
            "### Ranking Contract",
            "### Goal",
            "### Progress",
            "### Session Summary",
            "### Recent Actions",
            "### Recently Tapped",
            "### Candidates",
        ]
        .iter()
        .map(|header| prompt.find(header).expect(header))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{prompt}");
        assert!(prompt.contains("LoginActivity (4)"));
        assert!(prompt.contains(r#"[1] fp1 android.widget.Button at 0,0,100,40 text="Password" ocr="OCR""#));
    }

    #[test]
    fn budget_drops_history_first() {
        let history: Vec<String> = (0..200).map(|i| format!("[click] Screen{i}")).collect();
        let full = build(100_000, &history);
        assert!(full.contains("### Recent Actions"));

        let trimmed = build(full.len() - 100, &history);
        assert!(!trimmed.contains("### Recent Actions"));
        assert!(trimmed.contains("### Session Summary"));
        assert!(trimmed.contains("### Ranking Contract"));
        assert!(trimmed.contains("### Candidates"));
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let summary = HistorySummary::default();
        let candidates = vec![candidate(0, "Only")];
        let prompt = PromptBuilder::new(100_000)
            .build(&PromptInputs {
                goal: None,
                hints: &[],
                summary: &summary,
                history: &[],
                recent: &[],
                candidates: &candidates,
            })
            .expect("build prompt");
        assert!(!prompt.contains("### Goal"));
        assert!(!prompt.contains("### Progress"));
        assert!(!prompt.contains("### Recent Actions"));
        assert!(prompt.contains("### Candidates"));
    }

    #[test]
    fn tiny_budget_truncates_on_char_boundary() {
        let mut sections = vec![ParsedSection {
            key: "candidates".to_string(),
            required: true,
            content: "é".repeat(50),
        }];
        apply_budget_to_sections(&mut sections, 30);
        assert!(sections[0].content.len() <= 30);
        assert!(sections[0].content.ends_with("[truncated]"));
    }
}
