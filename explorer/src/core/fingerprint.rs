//! Content-addressed identity for screens and elements, and the de-duplicating
//! state store built on it.
//!
//! Fingerprint equality is treated as necessary and sufficient for identity.
//! Hash collisions are assumed negligible; there is no collision recovery.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::types::{Bounds, Element, Observation, ScreenState, StateId};

const FIELD_SEPARATOR: char = '\u{1f}';

/// Short SHA-256 digest: first 8 bytes, hex encoded (16 chars).
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Fingerprint an element from position, class, text and resource id.
///
/// The same logical control on repeated visits to the same screen maps to the
/// same fingerprint.
pub fn element_fingerprint(
    bounds: &Bounds,
    class_name: &str,
    text: Option<&str>,
    resource_id: Option<&str>,
) -> String {
    let normalized = [
        bounds.to_string(),
        class_name.trim().to_string(),
        text.map(str::trim).unwrap_or_default().to_string(),
        resource_id.map(str::trim).unwrap_or_default().to_string(),
    ]
    .join(&FIELD_SEPARATOR.to_string());
    content_hash(normalized.as_bytes())
}

/// Fingerprint a screen from its activity and element fingerprints in document order.
pub fn screen_fingerprint(activity: &str, elements: &[Element]) -> String {
    let mut normalized = String::with_capacity(activity.len() + elements.len() * 17);
    normalized.push_str(activity.trim());
    for element in elements {
        normalized.push(FIELD_SEPARATOR);
        normalized.push_str(&element.fingerprint);
    }
    content_hash(normalized.as_bytes())
}

/// Outcome of [`FingerprintStore::register_if_new`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub is_new: bool,
    /// The canonical state for the fingerprint (the newly created one, or the
    /// one registered on first sight).
    pub state: Arc<ScreenState>,
}

/// Directed transition between two discovered states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Edge {
    pub from: StateId,
    pub to: StateId,
}

/// Node summary for downstream graph rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: StateId,
    pub fingerprint: String,
    pub activity: String,
    pub parent: Option<StateId>,
    pub element_count: usize,
}

/// Discovered state graph. Nodes in discovery order, edges sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
}

/// Append-only set of discovered screens keyed by fingerprint.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    states: Vec<Arc<ScreenState>>,
    by_fingerprint: HashMap<String, usize>,
    edges: BTreeSet<Edge>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observation` unless its fingerprint is already known.
    ///
    /// A transition edge `parent -> state` is recorded either way (deduplicated,
    /// self-loops skipped). The parent of an existing state is never rewritten.
    pub fn register_if_new(
        &mut self,
        observation: Observation,
        parent: Option<StateId>,
    ) -> Registration {
        if let Some(&idx) = self.by_fingerprint.get(&observation.fingerprint) {
            let state = Arc::clone(&self.states[idx]);
            self.add_edge(parent, state.id);
            return Registration {
                is_new: false,
                state,
            };
        }

        let id = StateId(self.states.len() as u32);
        let state = Arc::new(ScreenState {
            id,
            fingerprint: observation.fingerprint,
            activity: observation.activity,
            screenshot_fingerprint: observation.screenshot_fingerprint,
            elements: observation.elements,
            parent,
        });
        self.by_fingerprint
            .insert(state.fingerprint.clone(), self.states.len());
        self.states.push(Arc::clone(&state));
        self.add_edge(parent, id);
        Registration {
            is_new: true,
            state,
        }
    }

    fn add_edge(&mut self, parent: Option<StateId>, child: StateId) {
        if let Some(from) = parent
            && from != child
        {
            self.edges.insert(Edge { from, to: child });
        }
    }

    /// Id of the state registered under `fingerprint`, if any.
    pub fn find(&self, fingerprint: &str) -> Option<StateId> {
        self.by_fingerprint
            .get(fingerprint)
            .map(|&idx| self.states[idx].id)
    }

    pub fn get(&self, id: StateId) -> Option<&Arc<ScreenState>> {
        self.states.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[Arc<ScreenState>] {
        &self.states
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn graph(&self) -> StateGraph {
        StateGraph {
            nodes: self
                .states
                .iter()
                .map(|state| GraphNode {
                    id: state.id,
                    fingerprint: state.fingerprint.clone(),
                    activity: state.activity.clone(),
                    parent: state.parent,
                    element_count: state.elements.len(),
                })
                .collect(),
            edges: self.edges.iter().copied().collect(),
        }
    }
}
