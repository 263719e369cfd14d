//! Multiplicative candidate ranking.
//!
//! Every edge `(candidate, weight)` reaching a candidate multiplies its score
//! by `weight + 1`. A candidate without an edge from some query key keeps its
//! score for that key, so missing attributes are not penalised. Scores are
//! normalised by their sum and the top `k` are returned, highest first, ties
//! in discovery order.

use std::collections::HashMap;
use std::hash::Hash;

/// A ranked candidate with its normalised score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ranked<I> {
    pub id: I,
    pub score: f64,
}

/// Rank the candidates reached by `edges`, keeping the best `k`.
pub fn rank<I>(edges: impl IntoIterator<Item = (I, u64)>, k: usize) -> Vec<Ranked<I>>
where
    I: Copy + Eq + Hash,
{
    let mut order: Vec<Ranked<I>> = Vec::new();
    let mut position: HashMap<I, usize> = HashMap::new();

    for (id, weight) in edges {
        let idx = *position.entry(id).or_insert_with(|| {
            order.push(Ranked { id, score: 1.0 });
            order.len() - 1
        });
        order[idx].score *= weight as f64 + 1.0;
    }

    let total: f64 = order.iter().map(|r| r.score).sum();
    if total > 0.0 {
        for r in &mut order {
            r.score /= total;
        }
    }

    // Stable sort keeps discovery order among equal scores.
    order.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(k);
    order
}
