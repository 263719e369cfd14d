//! Induced subgraph: a read-only projection of the store onto the static
//! attributes, behaviours and functions relevant to one query.

use std::collections::{HashMap, HashSet};

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use super::store::GraphState;
use super::{BehaviorId, FunctionId, NodeId, StaticAttributes};

/// Weighted directed projection; edges run static → behaviour → function.
#[derive(Debug, Clone, Default)]
pub struct InducedSubgraph {
    graph: DiGraph<NodeId, u64>,
}

impl InducedSubgraph {
    pub(crate) fn project(
        state: &GraphState,
        statics: &[&StaticAttributes],
        behaviors: &[BehaviorId],
        functions: &[FunctionId],
    ) -> Self {
        let mut graph = DiGraph::new();
        let mut index: HashMap<NodeId, NodeIndex> = HashMap::new();
        let mut add = |graph: &mut DiGraph<NodeId, u64>, id: NodeId| {
            *index.entry(id.clone()).or_insert_with(|| graph.add_node(id))
        };

        let mut pairs = Vec::new();
        let mut seen = HashSet::new();
        for vs in statics {
            for (attr, value) in vs.descriptive() {
                if seen.insert((attr.to_string(), value.clone())) {
                    pairs.push((attr.to_string(), value));
                }
            }
        }

        let static_idx: Vec<_> = pairs
            .iter()
            .map(|(attribute, value)| {
                add(
                    &mut graph,
                    NodeId::Static {
                        attribute: attribute.clone(),
                        value: value.clone(),
                    },
                )
            })
            .collect();
        let behavior_idx: Vec<_> = behaviors
            .iter()
            .filter(|id| state.behavior_nodes.contains_key(id))
            .map(|id| (*id, add(&mut graph, NodeId::Behavior(*id))))
            .collect();
        let function_idx: Vec<_> = functions
            .iter()
            .filter(|id| state.function_nodes.contains_key(id))
            .map(|id| (*id, add(&mut graph, NodeId::Function(*id))))
            .collect();

        for ((attribute, value), s_idx) in pairs.iter().zip(&static_idx) {
            let Some(edges) = state
                .static_edges
                .get(attribute)
                .and_then(|values| values.get(value))
            else {
                continue;
            };
            for (vb, b_idx) in &behavior_idx {
                if let Some(w) = edges.get(vb) {
                    graph.update_edge(*s_idx, *b_idx, *w);
                }
            }
        }

        for (vb, b_idx) in &behavior_idx {
            let Some(links) = state.behavior_edges.get(vb) else {
                continue;
            };
            for (vf, f_idx) in &function_idx {
                if let Some(w) = links.functions.get(vf) {
                    graph.update_edge(*b_idx, *f_idx, *w);
                }
            }
        }

        Self { graph }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// `(source, target, weight)` triples in insertion order.
    pub fn edges(&self) -> Vec<(NodeId, NodeId, u64)> {
        self.graph
            .edge_references()
            .map(|e| {
                (
                    self.graph[e.source()].clone(),
                    self.graph[e.target()].clone(),
                    *e.weight(),
                )
            })
            .collect()
    }

    /// Graphviz DOT text with `w=<weight>` edge labels.
    pub fn to_dot(&self) -> String {
        let dot = Dot::with_attr_getters(
            &self.graph,
            &[Config::EdgeNoLabel, Config::NodeNoLabel],
            &|_, e| format!("label=\"w={}\"", e.weight()),
            &|_, (_, id)| format!("label=\"{}\"", id.to_string().replace('"', "\\\"")),
        );
        format!("{dot}")
    }
}
