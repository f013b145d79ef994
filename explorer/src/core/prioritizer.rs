//! Candidate ordering policies.
//!
//! Every mode is a total function over the candidate set: candidates are only
//! reordered (and, in oracle mode, annotated), never dropped.

use serde::Serialize;

use crate::core::cycle_guard::{CycleGuard, CyclePattern};
use crate::core::types::{ActionHistoryEntry, Element, ExplorationMode, Screenshot};

/// What a scorer gets to see besides the candidates themselves.
#[derive(Debug, Clone, Copy)]
pub struct ScoringContext<'a> {
    pub goal_prompt: Option<&'a str>,
    pub history: &'a [ActionHistoryEntry],
    pub cycle_guard: &'a CycleGuard,
    pub screenshot: Option<&'a Screenshot>,
}

/// Score for one candidate, already cycle-penalized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub fingerprint: String,
    /// 0-100 after penalties.
    pub score: f64,
    pub reasoning: String,
    pub pattern: CyclePattern,
}

/// Where the base scores came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Oracle,
    RegexFallback,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidates {
    /// One score per candidate, in candidate order.
    pub scores: Vec<CandidateScore>,
    pub source: ScoreSource,
}

/// Anything that can rank candidates against a goal; the decision oracle client in practice.
pub trait CandidateScorer {
    fn score(&mut self, candidates: &[Element], context: &ScoringContext<'_>) -> ScoredCandidates;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub element: Element,
    pub score: Option<f64>,
    pub reasoning: Option<String>,
}

/// Ordered candidates plus, for oracle mode, where the scores came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub candidates: Vec<RankedCandidate>,
    pub source: Option<ScoreSource>,
}

/// Order `candidates` according to `mode`.
///
/// The scorer is only consulted in [`ExplorationMode::OracleGuided`]; ties keep
/// their original relative order.
pub fn prioritize<S: CandidateScorer + ?Sized>(
    mode: ExplorationMode,
    candidates: Vec<Element>,
    scorer: &mut S,
    context: &ScoringContext<'_>,
) -> Ranking {
    match mode {
        ExplorationMode::Sequential => Ranking {
            candidates: unscored(candidates),
            source: None,
        },
        ExplorationMode::Reverse => {
            let mut ranked = unscored(candidates);
            ranked.reverse();
            Ranking {
                candidates: ranked,
                source: None,
            }
        }
        ExplorationMode::OracleGuided => {
            if candidates.is_empty() {
                return Ranking {
                    candidates: Vec::new(),
                    source: None,
                };
            }
            let scored = scorer.score(&candidates, context);
            Ranking {
                candidates: order_by_scores(candidates, &scored.scores),
                source: Some(scored.source),
            }
        }
    }
}

fn unscored(candidates: Vec<Element>) -> Vec<RankedCandidate> {
    candidates
        .into_iter()
        .map(|element| RankedCandidate {
            element,
            score: None,
            reasoning: None,
        })
        .collect()
}

/// Attach scores by fingerprint and stable-sort descending.
///
/// Candidates the scorer did not mention sort last with no score.
pub fn order_by_scores(
    candidates: Vec<Element>,
    scores: &[CandidateScore],
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .map(|element| {
            let score = scores
                .iter()
                .find(|score| score.fingerprint == element.fingerprint);
            RankedCandidate {
                score: score.map(|s| s.score),
                reasoning: score.map(|s| s.reasoning.clone()),
                element,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        let a = a.score.unwrap_or(f64::NEG_INFINITY);
        let b = b.score.unwrap_or(f64::NEG_INFINITY);
        b.total_cmp(&a)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Bounds;

    struct FixedScorer {
        scores: Vec<f64>,
        calls: usize,
    }

    impl CandidateScorer for FixedScorer {
        fn score(
            &mut self,
            candidates: &[Element],
            _context: &ScoringContext<'_>,
        ) -> ScoredCandidates {
            self.calls += 1;
            ScoredCandidates {
                scores: candidates
                    .iter()
                    .zip(&self.scores)
                    .map(|(element, score)| CandidateScore {
                        fingerprint: element.fingerprint.clone(),
                        score: *score,
                        reasoning: format!("scored {score}"),
                        pattern: CyclePattern::None,
                    })
                    .collect(),
                source: ScoreSource::Oracle,
            }
        }
    }

    fn element(text: &str, top: i32) -> Element {
        Element::new(
            Bounds::new(0, top, 100, top + 40),
            "android.widget.Button",
            Some(text.to_string()),
            None,
            true,
        )
    }

    fn labels(ranking: &Ranking) -> Vec<&str> {
        ranking
            .candidates
            .iter()
            .map(|c| c.element.text.as_deref().unwrap_or_default())
            .collect()
    }

    fn candidates() -> Vec<Element> {
        vec![element("a", 0), element("b", 50), element("c", 100)]
    }

    fn run(mode: ExplorationMode, scorer: &mut FixedScorer) -> Ranking {
        let guard = CycleGuard::default();
        let context = ScoringContext {
            goal_prompt: None,
            history: &[],
            cycle_guard: &guard,
            screenshot: None,
        };
        prioritize(mode, candidates(), scorer, &context)
    }

    #[test]
    fn sequential_keeps_order_without_scoring() {
        let mut scorer = FixedScorer {
            scores: vec![],
            calls: 0,
        };
        let ranking = run(ExplorationMode::Sequential, &mut scorer);
        assert_eq!(labels(&ranking), vec!["a", "b", "c"]);
        assert_eq!(scorer.calls, 0);
        assert_eq!(ranking.source, None);
    }

    #[test]
    fn reverse_flips_order() {
        let mut scorer = FixedScorer {
            scores: vec![],
            calls: 0,
        };
        let ranking = run(ExplorationMode::Reverse, &mut scorer);
        assert_eq!(labels(&ranking), vec!["c", "b", "a"]);
    }

    #[test]
    fn oracle_guided_sorts_descending_with_stable_ties() {
        let mut scorer = FixedScorer {
            scores: vec![10.0, 80.0, 10.0],
            calls: 0,
        };
        let ranking = run(ExplorationMode::OracleGuided, &mut scorer);
        assert_eq!(labels(&ranking), vec!["b", "a", "c"]);
        assert_eq!(ranking.candidates[0].score, Some(80.0));
        assert_eq!(ranking.source, Some(ScoreSource::Oracle));
        assert_eq!(scorer.calls, 1);
    }

    #[test]
    fn unscored_candidates_are_kept_last() {
        let mut scorer = FixedScorer {
            scores: vec![5.0],
            calls: 0,
        };
        let ranking = run(ExplorationMode::OracleGuided, &mut scorer);
        assert_eq!(labels(&ranking), vec!["a", "b", "c"]);
        assert_eq!(ranking.candidates[2].score, None);
    }
}
