//! Bounded memory of recently clicked elements, used to damp repeating tap patterns.

use std::collections::VecDeque;

use serde::Serialize;

pub const DEFAULT_CAPACITY: usize = 5;

/// Repetition pattern a candidate would continue if clicked next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePattern {
    None,
    /// Same as the last click (A-A).
    ImmediateRepeat,
    /// Same as the click before last (A-B-A).
    Alternating,
    /// Same as three clicks ago (A-B-C-A).
    ShortCycle,
    /// Anywhere else in the buffer.
    RecentRepeat,
}

impl CyclePattern {
    pub fn penalty_factor(self) -> f64 {
        match self {
            CyclePattern::None => 1.0,
            CyclePattern::ImmediateRepeat => 0.2,
            CyclePattern::Alternating => 0.3,
            CyclePattern::ShortCycle => 0.4,
            CyclePattern::RecentRepeat => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CyclePattern::None => "none",
            CyclePattern::ImmediateRepeat => "immediate_repeat",
            CyclePattern::Alternating => "alternating",
            CyclePattern::ShortCycle => "short_cycle",
            CyclePattern::RecentRepeat => "recent_repeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub pattern: CyclePattern,
    pub penalty_factor: f64,
}

/// Ring buffer of element fingerprints, most recent first.
#[derive(Debug, Clone)]
pub struct CycleGuard {
    recent: VecDeque<String>,
    capacity: usize,
}

impl Default for CycleGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CycleGuard {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Classify a candidate against the buffer. First match wins, in penalty order.
    pub fn classify(&self, fingerprint: &str) -> Classification {
        let position = self.recent.iter().position(|recent| recent == fingerprint);
        let pattern = match position {
            None => CyclePattern::None,
            Some(0) => CyclePattern::ImmediateRepeat,
            Some(1) => CyclePattern::Alternating,
            Some(2) => CyclePattern::ShortCycle,
            Some(_) => CyclePattern::RecentRepeat,
        };
        Classification {
            pattern,
            penalty_factor: pattern.penalty_factor(),
        }
    }

    pub fn record(&mut self, fingerprint: impl Into<String>) {
        self.recent.push_front(fingerprint.into());
        self.recent.truncate(self.capacity);
    }

    /// Recently clicked fingerprints, most recent first.
    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
