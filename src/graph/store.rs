//! The knowledge store: graph state behind one coarse lock.
//!
//! Mutations (`update_graph*`, `merge_function_nodes`, `clean_dictionaries`,
//! `register_patterns`, `save*`) take the write lock; candidate selection and
//! lookups take the read lock, so readers see an update either entirely or
//! not at all.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult, StoreResult};

use super::candidates::{self, Ranked};
use super::dictionary::{NewValueFlags, PatternDictionaries, TermRemap};
use super::induced::InducedSubgraph;
use super::persist::{self, LoadReport};
use super::{
    BehaviorId, BehaviorNode, BehaviorPattern, FunctionId, FunctionNode, KnowledgeUnit, Node,
    NodeId, StaticAttributeNode, StaticAttributes,
};

/// `attribute → value → behaviour → weight`.
pub type StaticEdges = BTreeMap<String, BTreeMap<String, BTreeMap<BehaviorId, u64>>>;

/// Outgoing edges of one behaviour node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorLinks {
    /// `attribute → value → weight`, mirroring [`StaticEdges`].
    #[serde(default)]
    pub statics: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    pub functions: BTreeMap<FunctionId, u64>,
}

/// The six persisted structures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GraphState {
    pub dictionaries: PatternDictionaries,
    pub static_edges: StaticEdges,
    pub behavior_edges: BTreeMap<BehaviorId, BehaviorLinks>,
    pub behavior_nodes: BTreeMap<BehaviorId, BehaviorNode>,
    pub function_edges: BTreeMap<FunctionId, BTreeMap<BehaviorId, u64>>,
    pub function_nodes: BTreeMap<FunctionId, FunctionNode>,
}

/// A ranked candidate together with its node data.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<I, N> {
    pub id: I,
    pub score: f64,
    pub node: N,
}

pub type BehaviorCandidate = Candidate<BehaviorId, BehaviorNode>;
pub type FunctionCandidate = Candidate<FunctionId, FunctionNode>;

/// Node and edge counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub static_nodes: usize,
    pub behavior_nodes: usize,
    pub function_nodes: usize,
    pub static_edges: usize,
    pub function_edges: usize,
    pub dictionary_terms: usize,
}

/// Shared weighted knowledge graph.
#[derive(Debug, Default)]
pub struct KnowledgeStore {
    state: RwLock<GraphState>,
}

impl KnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store and load the checkpoint `tag` from `dir`.
    pub fn open(dir: &Path, tag: u64) -> StoreResult<Self> {
        let store = Self::new();
        store.load(dir, tag)?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Add one knowledge unit. Returns the behaviour id it was attached to,
    /// or `None` when the unit has no behaviour.
    pub fn update_graph(&self, unit: &KnowledgeUnit) -> Option<BehaviorId> {
        let mut state = self.state.write().expect("graph lock poisoned");
        state.apply(unit)
    }

    /// Add units in order under a single write lock.
    pub fn update_graph_batch(&self, units: &[KnowledgeUnit]) -> usize {
        let mut state = self.state.write().expect("graph lock poisoned");
        let applied = units.iter().filter_map(|u| state.apply(u)).count();
        tracing::debug!(units = units.len(), applied, "graph batch committed");
        applied
    }

    /// Fold `source` into `target`: edge weights are summed and `source` is
    /// deleted. Returns `false` (and changes nothing) when either id is
    /// unknown or both are the same node.
    pub fn merge_function_nodes(&self, target: FunctionId, source: FunctionId) -> bool {
        let mut state = self.state.write().expect("graph lock poisoned");
        state.merge_functions(target, source)
    }

    /// Apply a term remap to the pattern dictionaries.
    pub fn clean_dictionaries(&self, remap: &TermRemap) -> usize {
        let mut state = self.state.write().expect("graph lock poisoned");
        let cleaned = state.dictionaries.clean(remap);
        if cleaned > 0 {
            tracing::info!(cleaned, "pattern dictionaries cleaned");
        }
        cleaned
    }

    /// Add a pattern's values to the dictionaries, flagging the new ones.
    pub fn register_patterns(&self, pattern: &BehaviorPattern) -> NewValueFlags {
        let mut state = self.state.write().expect("graph lock poisoned");
        state.dictionaries.register(pattern)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Top-`k` behaviours reached from the distinct non-reserved attribute
    /// pairs of `statics`.
    pub fn select_behavior_candidates(
        &self,
        statics: &[&StaticAttributes],
        k: usize,
    ) -> Vec<BehaviorCandidate> {
        let state = self.state.read().expect("graph lock poisoned");
        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        for vs in statics {
            for (attr, value) in vs.descriptive() {
                if !seen.insert((attr.to_string(), value.clone())) {
                    continue;
                }
                if let Some(targets) = state.static_edges.get(attr).and_then(|v| v.get(&value)) {
                    edges.extend(targets.iter().map(|(vb, w)| (*vb, *w)));
                }
            }
        }
        candidates::rank(edges, k)
            .into_iter()
            .filter_map(|Ranked { id, score }| {
                let node = state.behavior_nodes.get(&id)?.clone();
                Some(Candidate { id, score, node })
            })
            .collect()
    }

    /// Top-`k` functions reached from the distinct `behaviors`.
    pub fn select_function_candidates(
        &self,
        behaviors: &[BehaviorId],
        k: usize,
    ) -> Vec<FunctionCandidate> {
        let state = self.state.read().expect("graph lock poisoned");
        let mut seen = HashSet::new();
        let edges: Vec<(FunctionId, u64)> = behaviors
            .iter()
            .filter(|vb| seen.insert(**vb))
            .filter_map(|vb| state.behavior_edges.get(vb))
            .flat_map(|links| links.functions.iter().map(|(vf, w)| (*vf, *w)))
            .collect();
        candidates::rank(edges, k)
            .into_iter()
            .filter_map(|Ranked { id, score }| {
                let node = state.function_nodes.get(&id)?.clone();
                Some(Candidate { id, score, node })
            })
            .collect()
    }

    /// Heaviest function attached to the behaviour with the same canonical
    /// content as `pattern`.
    pub fn best_function_for(&self, pattern: &BehaviorPattern) -> Option<(FunctionId, FunctionNode)> {
        let vb = pattern.canonical_id()?;
        let state = self.state.read().expect("graph lock poisoned");
        let links = state.behavior_edges.get(&vb)?;
        let (vf, _) = links
            .functions
            .iter()
            .fold(None::<(FunctionId, u64)>, |best, (vf, w)| match best {
                Some((_, bw)) if bw >= *w => best,
                _ => Some((*vf, *w)),
            })?;
        let node = state.function_nodes.get(&vf)?.clone();
        Some((vf, node))
    }

    pub fn function_exists(&self, id: FunctionId) -> bool {
        let state = self.state.read().expect("graph lock poisoned");
        state.function_nodes.contains_key(&id)
    }

    pub fn behavior_node(&self, id: BehaviorId) -> Option<BehaviorNode> {
        let state = self.state.read().expect("graph lock poisoned");
        state.behavior_nodes.get(&id).cloned()
    }

    pub fn function_node(&self, id: FunctionId) -> Option<FunctionNode> {
        let state = self.state.read().expect("graph lock poisoned");
        state.function_nodes.get(&id).cloned()
    }

    /// Like [`Self::behavior_node`], for callers that treat absence as an error.
    pub fn require_behavior(&self, id: BehaviorId) -> GraphResult<BehaviorNode> {
        self.behavior_node(id)
            .ok_or_else(|| GraphError::BehaviorNotFound { id: id.to_string() })
    }

    pub fn require_function(&self, id: FunctionId) -> GraphResult<FunctionNode> {
        self.function_node(id)
            .ok_or_else(|| GraphError::FunctionNotFound { id: id.to_string() })
    }

    /// Snapshot of all stored functions.
    pub fn function_nodes(&self) -> BTreeMap<FunctionId, FunctionNode> {
        let state = self.state.read().expect("graph lock poisoned");
        state.function_nodes.clone()
    }

    /// Snapshot of the pattern dictionaries.
    pub fn dictionaries(&self) -> PatternDictionaries {
        let state = self.state.read().expect("graph lock poisoned");
        state.dictionaries.clone()
    }

    /// Edges of one behaviour node.
    pub fn behavior_links(&self, id: BehaviorId) -> Option<BehaviorLinks> {
        let state = self.state.read().expect("graph lock poisoned");
        state.behavior_edges.get(&id).cloned()
    }

    /// Behaviour edges of one function node.
    pub fn function_links(&self, id: FunctionId) -> Option<BTreeMap<BehaviorId, u64>> {
        let state = self.state.read().expect("graph lock poisoned");
        state.function_edges.get(&id).cloned()
    }

    /// Look up any node by id.
    pub fn node(&self, id: &NodeId) -> Option<Node> {
        let state = self.state.read().expect("graph lock poisoned");
        match id {
            NodeId::Static { attribute, value } => {
                let behaviors = state.static_edges.get(attribute)?.get(value)?.clone();
                Some(Node::Static(StaticAttributeNode {
                    attribute: attribute.clone(),
                    value: value.clone(),
                    behaviors,
                }))
            }
            NodeId::Behavior(vb) => state.behavior_nodes.get(vb).cloned().map(Node::Behavior),
            NodeId::Function(vf) => state.function_nodes.get(vf).cloned().map(Node::Function),
        }
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read().expect("graph lock poisoned");
        StoreStats {
            static_nodes: state.static_edges.values().map(BTreeMap::len).sum(),
            behavior_nodes: state.behavior_nodes.len(),
            function_nodes: state.function_nodes.len(),
            static_edges: state
                .static_edges
                .values()
                .flat_map(BTreeMap::values)
                .map(BTreeMap::len)
                .sum(),
            function_edges: state.function_edges.values().map(BTreeMap::len).sum(),
            dictionary_terms: state.dictionaries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.read().expect("graph lock poisoned");
        state.behavior_nodes.is_empty() && state.function_nodes.is_empty()
    }

    /// Projection onto the given attribute records, behaviours and functions.
    pub fn induced_subgraph(
        &self,
        statics: &[&StaticAttributes],
        behaviors: &[BehaviorId],
        functions: &[FunctionId],
    ) -> InducedSubgraph {
        let state = self.state.read().expect("graph lock poisoned");
        InducedSubgraph::project(&state, statics, behaviors, functions)
    }

    /// DOT rendering of [`Self::induced_subgraph`].
    pub fn render_induced_subgraph(
        &self,
        statics: &[&StaticAttributes],
        behaviors: &[BehaviorId],
        functions: &[FunctionId],
    ) -> String {
        self.induced_subgraph(statics, behaviors, functions).to_dot()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn save(&self, dir: &Path, tag: u64) -> StoreResult<()> {
        self.save_alongside(dir, tag, || Ok(()))
    }

    /// Save the store and run `also` while still holding the write lock, so
    /// nothing is committed between the two writes.
    pub fn save_alongside(
        &self,
        dir: &Path,
        tag: u64,
        also: impl FnOnce() -> StoreResult<()>,
    ) -> StoreResult<()> {
        let state = self.state.write().expect("graph lock poisoned");
        persist::save_state(dir, tag, &state)?;
        also()
    }

    /// Load checkpoint `tag`. Missing documents leave the matching
    /// structure untouched.
    pub fn load(&self, dir: &Path, tag: u64) -> StoreResult<LoadReport> {
        let mut state = self.state.write().expect("graph lock poisoned");
        persist::load_into(dir, tag, &mut state)
    }
}

impl GraphState {
    fn apply(&mut self, unit: &KnowledgeUnit) -> Option<BehaviorId> {
        let pattern = unit.v_b.as_ref()?;
        let vb = pattern.canonical_id()?;

        if !self.behavior_nodes.contains_key(&vb) {
            self.behavior_nodes
                .insert(vb, BehaviorNode::from_pattern(pattern));
            self.behavior_edges.insert(vb, BehaviorLinks::default());
            tracing::trace!(%vb, "behaviour node created");
        }

        for (attr, value) in unit.v_s.descriptive() {
            *self
                .static_edges
                .entry(attr.to_string())
                .or_default()
                .entry(value.clone())
                .or_default()
                .entry(vb)
                .or_insert(0) += 1;
            *self
                .behavior_edges
                .entry(vb)
                .or_default()
                .statics
                .entry(attr.to_string())
                .or_default()
                .entry(value)
                .or_insert(0) += 1;
        }

        if let Some(func) = &unit.v_f {
            let vf = func
                .vf_id
                .filter(|id| self.function_nodes.contains_key(id))
                .or_else(|| func.id());
            if let Some(vf) = vf {
                self.function_nodes.entry(vf).or_insert_with(|| FunctionNode {
                    description: func.description.clone(),
                    code: func.code.clone(),
                });
                *self
                    .behavior_edges
                    .entry(vb)
                    .or_default()
                    .functions
                    .entry(vf)
                    .or_insert(0) += 1;
                *self
                    .function_edges
                    .entry(vf)
                    .or_default()
                    .entry(vb)
                    .or_insert(0) += 1;
            }
        }

        Some(vb)
    }

    fn merge_functions(&mut self, target: FunctionId, source: FunctionId) -> bool {
        if target == source {
            tracing::warn!(%target, "refusing to merge a function node into itself");
            return false;
        }
        if !self.function_nodes.contains_key(&target) || !self.function_nodes.contains_key(&source)
        {
            tracing::warn!(%target, %source, "merge skipped: function node not found");
            return false;
        }

        let moved = self.function_edges.remove(&source).unwrap_or_default();
        let target_edges = self.function_edges.entry(target).or_default();
        for (vb, w) in &moved {
            *target_edges.entry(*vb).or_insert(0) += w;
        }

        // Sweep every behaviour so no edge can be left pointing at `source`.
        for links in self.behavior_edges.values_mut() {
            if let Some(w) = links.functions.remove(&source) {
                *links.functions.entry(target).or_insert(0) += w;
            }
        }

        self.function_nodes.remove(&source);
        tracing::info!(%target, %source, behaviors = moved.len(), "function nodes merged");
        true
    }
}
