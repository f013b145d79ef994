//! Decision oracle client: builds ranking requests, parses answers, and
//! degrades to regex extraction and then random scores when the oracle fails.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use jsonschema::{Draft, Validator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::cycle_guard::CycleGuard;
use crate::core::history::{HistorySummary, recent_lines};
use crate::core::prioritizer::{
    CandidateScore, CandidateScorer, ScoreSource, ScoredCandidates, ScoringContext,
};
use crate::core::progress::{GoalProgress, extract_steps, next_step_hints};
use crate::core::types::{Element, Screenshot};
use crate::error::ExploreError;
use crate::io::config::ExplorerConfig;
use crate::io::oracle::{ElementContext, Oracle, OracleRequest};
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::vision::ElementVision;

const ORACLE_RESPONSE_SCHEMA: &str = include_str!("../schemas/oracle_response.schema.json");

/// Bytes searched for a score after a fingerprint mention in free text.
const REGEX_WINDOW_BYTES: usize = 160;

/// Knobs for request building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
    pub prompt_budget_bytes: usize,
    pub history_lines: usize,
    pub padding_px: i32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            prompt_budget_bytes: 40_000,
            history_lines: 20,
            padding_px: 20,
        }
    }
}

impl ClientSettings {
    pub fn from_config(config: &ExplorerConfig) -> Self {
        Self {
            prompt_budget_bytes: config.oracle.prompt_budget_bytes,
            history_lines: config.oracle.history_lines,
            padding_px: config.vision.padding_px,
        }
    }
}

/// One entry of a structured oracle answer.
#[derive(Debug, Clone, Deserialize)]
struct RawScore {
    index: Option<usize>,
    fingerprint: Option<String>,
    score: Value,
    reasoning: Option<String>,
}

/// Base score before cycle penalties.
#[derive(Debug, Clone, PartialEq)]
struct BaseScore {
    score: f64,
    reasoning: String,
}

/// Ranks candidates through an [`Oracle`], never failing the caller.
pub struct DecisionOracleClient<O, V> {
    oracle: O,
    vision: V,
    settings: ClientSettings,
    validator: Validator,
    rng: StdRng,
}

impl<O: Oracle, V: ElementVision> DecisionOracleClient<O, V> {
    pub fn new(oracle: O, vision: V, settings: ClientSettings) -> Result<Self> {
        Self::with_rng(oracle, vision, settings, StdRng::from_entropy())
    }

    /// Deterministic random fallback, for tests and reproducible runs.
    pub fn with_seed(oracle: O, vision: V, settings: ClientSettings, seed: u64) -> Result<Self> {
        Self::with_rng(oracle, vision, settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(oracle: O, vision: V, settings: ClientSettings, rng: StdRng) -> Result<Self> {
        let schema: Value =
            serde_json::from_str(ORACLE_RESPONSE_SCHEMA).context("parse oracle response schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .context("compile oracle response schema")?;
        Ok(Self {
            oracle,
            vision,
            settings,
            validator,
            rng,
        })
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Build the ranking request for `candidates`.
    pub fn build_request(
        &self,
        candidates: &[Element],
        context: &ScoringContext<'_>,
    ) -> Result<OracleRequest> {
        let hints = match context.goal_prompt {
            Some(goal) => {
                let steps = extract_steps(goal).steps;
                next_step_hints(&GoalProgress::from_history(steps, context.history))
            }
            None => Vec::new(),
        };
        let summary = HistorySummary::from_history(context.history);
        let history = recent_lines(context.history, self.settings.history_lines);
        let recent = recent_fingerprints(context.cycle_guard);
        let elements: Vec<ElementContext> = candidates
            .iter()
            .enumerate()
            .map(|(index, element)| self.element_context(index, element, context.screenshot))
            .collect();

        let prompt = PromptBuilder::new(self.settings.prompt_budget_bytes).build(&PromptInputs {
            goal: context.goal_prompt,
            hints: &hints,
            summary: &summary,
            history: &history,
            recent: &recent,
            candidates: &elements,
        })?;
        Ok(OracleRequest { prompt, elements })
    }

    fn element_context(
        &self,
        index: usize,
        element: &Element,
        screenshot: Option<&Screenshot>,
    ) -> ElementContext {
        let mut context = ElementContext {
            index,
            fingerprint: element.fingerprint.clone(),
            class_name: element.class_name.clone(),
            text: element.text.clone(),
            resource_id: element.resource_id.clone(),
            content_desc: element.content_desc.clone(),
            bounds: element.bounds,
            crop_png_base64: None,
            ocr_text: None,
        };
        let Some(screenshot) = screenshot.filter(|s| !s.png.is_empty()) else {
            return context;
        };
        let region = element.bounds.padded(
            self.settings.padding_px,
            screen_limit(screenshot.width),
            screen_limit(screenshot.height),
        );
        match self.vision.inspect(screenshot, region) {
            Ok(crop) => {
                context.crop_png_base64 = crop.image.map(|png| STANDARD.encode(png));
                context.ocr_text = crop.ocr_text;
            }
            Err(err) => {
                debug!(fingerprint = %element.fingerprint, err = %format!("{err:#}"), "element crop failed");
            }
        }
        context
    }

    fn ask(&self, candidates: &[Element], context: &ScoringContext<'_>) -> Result<String> {
        let request = self.build_request(candidates, context)?;
        self.oracle.rank(&request)
    }

    /// Parse a structured answer. `None` when no candidate could be matched.
    fn parse_structured(&self, raw: &str, candidates: &[Element]) -> Option<Vec<BaseScore>> {
        let entries = json_candidates(raw)
            .into_iter()
            .filter_map(|text| serde_json::from_str::<Value>(text).ok())
            .find(|value| self.validator.is_valid(value))
            .and_then(|value| serde_json::from_value::<Vec<RawScore>>(value).ok())?;

        let mut matched = false;
        let scores = candidates
            .iter()
            .enumerate()
            .map(|(index, element)| {
                let entry = entries
                    .iter()
                    .find(|e| e.fingerprint.as_deref() == Some(element.fingerprint.as_str()))
                    .or_else(|| {
                        entries.iter().find(|e| {
                            e.index == Some(index)
                                && !e.fingerprint.as_deref().is_some_and(|fp| {
                                    candidates.iter().any(|c| c.fingerprint == fp)
                                })
                        })
                    });
                match entry.and_then(|e| score_value(&e.score).map(|score| (e, score))) {
                    Some((entry, score)) => {
                        matched = true;
                        BaseScore {
                            score,
                            reasoning: entry
                                .reasoning
                                .clone()
                                .filter(|r| !r.trim().is_empty())
                                .unwrap_or_else(|| "no reasoning given".to_string()),
                        }
                    }
                    None => BaseScore {
                        score: 0.0,
                        reasoning: "not ranked by oracle".to_string(),
                    },
                }
            })
            .collect();
        matched.then_some(scores)
    }

    fn random_scores(&mut self, count: usize) -> Vec<BaseScore> {
        (0..count)
            .map(|_| BaseScore {
                score: self.rng.gen_range(0.0..100.0),
                reasoning: "random fallback".to_string(),
            })
            .collect()
    }
}

impl<O: Oracle, V: ElementVision> CandidateScorer for DecisionOracleClient<O, V> {
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    fn score(&mut self, candidates: &[Element], context: &ScoringContext<'_>) -> ScoredCandidates {
        let answer = self.ask(candidates, context).map_err(|err| {
            let err = ExploreError::Oracle(format!("{err:#}"));
            warn!(err = %err, "oracle unavailable; falling back");
            err
        });

        let (base, source) = match answer {
            Ok(raw) => {
                if let Some(scores) = self.parse_structured(&raw, candidates) {
                    (scores, ScoreSource::Oracle)
                } else if let Some(scores) = extract_scores_by_regex(&raw, candidates) {
                    warn!("oracle answer was not structured; used regex extraction");
                    (scores, ScoreSource::RegexFallback)
                } else {
                    warn!("oracle answer held no scores; using random scores");
                    (self.random_scores(candidates.len()), ScoreSource::Random)
                }
            }
            Err(_) => (self.random_scores(candidates.len()), ScoreSource::Random),
        };

        let scores = apply_cycle_penalties(candidates, base, context.cycle_guard);
        debug!(source = ?source, "candidates scored");
        ScoredCandidates { scores, source }
    }
}

fn apply_cycle_penalties(
    candidates: &[Element],
    base: Vec<BaseScore>,
    guard: &CycleGuard,
) -> Vec<CandidateScore> {
    candidates
        .iter()
        .zip(base)
        .map(|(element, base)| {
            let classification = guard.classify(&element.fingerprint);
            let mut reasoning = base.reasoning;
            if classification.penalty_factor < 1.0 {
                reasoning.push_str(&format!(" [pattern: {}]", classification.pattern.as_str()));
            }
            CandidateScore {
                fingerprint: element.fingerprint.clone(),
                score: base.score * classification.penalty_factor,
                reasoning,
                pattern: classification.pattern,
            }
        })
        .collect()
}

fn recent_fingerprints(guard: &CycleGuard) -> Vec<String> {
    guard.recent().map(str::to_string).collect()
}

/// Unknown screenshot dimensions must not collapse the crop region.
fn screen_limit(dimension: u32) -> i32 {
    if dimension == 0 {
        i32::MAX
    } else {
        i32::try_from(dimension).unwrap_or(i32::MAX)
    }
}

/// Slices of `raw` that may hold the JSON answer: the whole text, fenced
/// blocks, then the outermost bracketed span.
fn json_candidates(raw: &str) -> Vec<&str> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());

    let mut out = vec![raw.trim()];
    out.extend(
        FENCE_RE
            .captures_iter(raw)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim()),
    );
    if let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']'))
        && start < end
    {
        out.push(&raw[start..=end]);
    }
    out
}

/// Accept numbers and numeric strings ("85", "85%"), clamped to 0-100.
fn score_value(value: &Value) -> Option<f64> {
    let score = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok()?,
        _ => return None,
    };
    score.is_finite().then(|| score.clamp(0.0, 100.0))
}

/// Last-resort parse of free text. `None` when nothing could be extracted.
fn extract_scores_by_regex(raw: &str, candidates: &[Element]) -> Option<Vec<BaseScore>> {
    static SCORE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)score\W{0,5}(\d{1,3}(?:\.\d+)?)").unwrap());
    static INDEX_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?im)^\W*(?:candidate|element|index)?\s*#?\[?(\d+)\]?[\s:.)\-]+.*?score\W{0,5}(\d{1,3}(?:\.\d+)?)",
        )
        .unwrap()
    });

    let by_index: Vec<(usize, f64)> = INDEX_LINE_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let index = caps.get(1)?.as_str().parse().ok()?;
            let score = caps.get(2)?.as_str().parse().ok()?;
            Some((index, score))
        })
        .collect();

    let mut matched = false;
    let scores = candidates
        .iter()
        .enumerate()
        .map(|(index, element)| {
            let near_fingerprint = raw.find(&element.fingerprint).and_then(|pos| {
                let window_end = floor_boundary(raw, pos + REGEX_WINDOW_BYTES);
                SCORE_RE
                    .captures(&raw[pos..window_end])
                    .and_then(|caps| caps.get(1))
                    .and_then(|m| m.as_str().parse::<f64>().ok())
            });
            let score = near_fingerprint.or_else(|| {
                by_index
                    .iter()
                    .find(|(i, _)| *i == index)
                    .map(|(_, score)| *score)
            });
            match score {
                Some(score) => {
                    matched = true;
                    BaseScore {
                        score: score.clamp(0.0, 100.0),
                        reasoning: "extracted from unstructured oracle answer".to_string(),
                    }
                }
                None => BaseScore {
                    score: 0.0,
                    reasoning: "not ranked by oracle".to_string(),
                },
            }
        })
        .collect();
    matched.then_some(scores)
}

fn floor_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cycle_guard::CyclePattern;
    use crate::io::vision::NoVision;
    use crate::test_support::{ScriptedOracle, ScriptedVision, button};

    fn candidates() -> Vec<Element> {
        vec![button(0, "Email"), button(1, "Password"), button(2, "Submit")]
    }

    fn client(oracle: ScriptedOracle) -> DecisionOracleClient<ScriptedOracle, NoVision> {
        DecisionOracleClient::with_seed(oracle, NoVision, ClientSettings::default(), 7)
            .expect("client")
    }

    fn score_with(
        client: &mut DecisionOracleClient<ScriptedOracle, NoVision>,
        candidates: &[Element],
        guard: &CycleGuard,
    ) -> ScoredCandidates {
        let context = ScoringContext {
            goal_prompt: Some("[Login]\n1. Tap email\n2. Tap password"),
            history: &[],
            cycle_guard: guard,
            screenshot: None,
        };
        client.score(candidates, &context)
    }

    #[test]
    fn structured_answer_is_matched_by_fingerprint() {
        let c = candidates();
        let answer = format!(
            r#"[{{"fingerprint": "{}", "score": 90, "reasoning": "submit"}},
                {{"fingerprint": "{}", "score": "40%", "reasoning": "email"}}]"#,
            c[2].fingerprint, c[0].fingerprint
        );
        let mut client = client(ScriptedOracle::answering([answer]));
        let scored = score_with(&mut client, &c, &CycleGuard::default());

        assert_eq!(scored.source, ScoreSource::Oracle);
        let values: Vec<f64> = scored.scores.iter().map(|s| s.score).collect();
        assert_eq!(values, vec![40.0, 0.0, 90.0]);
        assert_eq!(scored.scores[1].reasoning, "not ranked by oracle");
        assert_eq!(scored.scores[2].reasoning, "submit");
    }

    #[test]
    fn fenced_answer_is_matched_by_index() {
        let c = candidates();
        let answer = "Here you go:\n```json\n[{\"index\": 1, \"score\": 75}]\n```\n";
        let mut client = client(ScriptedOracle::answering([answer]));
        let scored = score_with(&mut client, &c, &CycleGuard::default());

        assert_eq!(scored.source, ScoreSource::Oracle);
        assert_eq!(scored.scores[1].score, 75.0);
        assert_eq!(scored.scores[1].reasoning, "no reasoning given");
    }

    #[test]
    fn schema_violations_fall_back_to_regex() {
        let c = candidates();
        let answer = format!(
            "I'd pick {} (score: 80) over the rest.\n[{{\"reasoning\": \"missing score\"}}]",
            c[1].fingerprint
        );
        let mut client = client(ScriptedOracle::answering([answer]));
        let scored = score_with(&mut client, &c, &CycleGuard::default());

        assert_eq!(scored.source, ScoreSource::RegexFallback);
        assert_eq!(scored.scores[1].score, 80.0);
        assert_eq!(scored.scores[0].score, 0.0);
    }

    #[test]
    fn regex_reads_indexed_lines() {
        let c = candidates();
        let answer = "0: the email field, score 30\n2) submit button - score: 95\n";
        let scores = extract_scores_by_regex(answer, &c).expect("scores");
        let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
        assert_eq!(values, vec![30.0, 0.0, 95.0]);
    }

    #[test]
    fn unparsable_answer_keeps_every_candidate() {
        let c = candidates();
        let mut client = client(ScriptedOracle::answering(["¯\\_(ツ)_/¯"]));
        let scored = score_with(&mut client, &c, &CycleGuard::default());

        assert_eq!(scored.source, ScoreSource::Random);
        assert_eq!(scored.scores.len(), c.len());
        for (score, element) in scored.scores.iter().zip(&c) {
            assert_eq!(score.fingerprint, element.fingerprint);
            assert!((0.0..100.0).contains(&score.score));
        }
    }

    #[test]
    fn oracle_errors_fall_back_to_random() {
        let c = candidates();
        let mut client = client(ScriptedOracle::failing("connection refused"));
        let scored = score_with(&mut client, &c, &CycleGuard::default());
        assert_eq!(scored.source, ScoreSource::Random);
        assert_eq!(scored.scores.len(), 3);
    }

    #[test]
    fn cycle_penalty_is_multiplicative_and_named() {
        let c = candidates();
        let answer = format!(
            r#"[{{"fingerprint": "{}", "score": 50, "reasoning": "again"}}]"#,
            c[0].fingerprint
        );
        let mut guard = CycleGuard::default();
        guard.record(c[0].fingerprint.clone());
        let mut client = client(ScriptedOracle::answering([answer]));
        let scored = score_with(&mut client, &c, &guard);

        assert_eq!(scored.scores[0].pattern, CyclePattern::ImmediateRepeat);
        assert!((scored.scores[0].score - 10.0).abs() < 1e-9);
        assert_eq!(scored.scores[0].reasoning, "again [pattern: immediate_repeat]");
    }

    #[test]
    fn request_carries_goal_progress_and_recent_taps() {
        let c = candidates();
        let mut guard = CycleGuard::default();
        guard.record("deadbeefdeadbeef");
        let client = client(ScriptedOracle::answering(["[]"]));
        let context = ScoringContext {
            goal_prompt: Some("[Login]\n1. Tap email field\n2. Tap password field"),
            history: &[],
            cycle_guard: &guard,
            screenshot: None,
        };
        let request = client.build_request(&c, &context).expect("request");

        assert_eq!(request.elements.len(), 3);
        assert_eq!(request.elements[2].index, 2);
        assert!(request.prompt.contains("Start by tap email field"));
        assert!(request.prompt.contains("deadbeefdeadbeef"));
        assert!(request.prompt.contains(&c[1].fingerprint));
    }

    #[test]
    fn crops_are_padded_and_encoded() {
        let vision = ScriptedVision {
            ocr_text: Some("Email".to_string()),
            ..ScriptedVision::default()
        };
        let client = DecisionOracleClient::with_seed(
            ScriptedOracle::answering(["[]"]),
            vision,
            ClientSettings::default(),
            1,
        )
        .expect("client");
        let screenshot = Screenshot {
            png: vec![1, 2, 3],
            width: 1080,
            height: 1920,
        };
        let guard = CycleGuard::default();
        let context = ScoringContext {
            goal_prompt: None,
            history: &[],
            cycle_guard: &guard,
            screenshot: Some(&screenshot),
        };
        let element = button(0, "Email");
        let request = client.build_request(&[element.clone()], &context).expect("request");

        let regions = client.vision.regions.borrow();
        assert_eq!(regions.as_slice(), &[element.bounds.padded(20, 1080, 1920)]);
        assert_eq!(request.elements[0].crop_png_base64.as_deref(), Some("Y3JvcA=="));
        assert_eq!(request.elements[0].ocr_text.as_deref(), Some("Email"));
    }
}
