//! Collaborator interfaces.
//!
//! Pattern extraction, redundancy analysis and the imputation chain are
//! produced by external services. The pipelines only see these traits; a
//! collaborator may fail at any call and the failure classifier decides
//! whether to retry.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use dashmap::DashMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::dictionary::NewValueFlags;
use crate::graph::store::{BehaviorCandidate, FunctionCandidate, KnowledgeStore};
use crate::graph::{KnowledgeUnit, SpatialFunction};
use crate::ledger::{BehaviorSelection, Explanation, ImputedPoint, MethodSelection};
use crate::redundancy::{DedupRequest, RedundancyDecisions};
use crate::task::Task;
use crate::trajectory::{TrajectoryRow, duration_bucket};

/// Failure reported by a collaborator.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum CollaboratorError {
    #[error("collaborator call failed: {message}")]
    #[diagnostic(
        code(vista::collab::failed),
        help("The call is retried up to max_retries times before a placeholder is recorded.")
    )]
    Failed { message: String },

    #[error("collaborator output could not be parsed: {message}")]
    #[diagnostic(
        code(vista::collab::malformed),
        help("The producer returned text that does not match the expected structure.")
    )]
    Malformed { message: String },
}

impl CollaboratorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

pub type CollabResult<T> = std::result::Result<T, CollaboratorError>;

// ---------------------------------------------------------------------------
// Usage metrics
// ---------------------------------------------------------------------------

/// What a collaborator call was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Pattern,
    Function,
    Redundancy,
    Selection,
    Explanation,
}

/// Accumulated usage for one purpose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub elapsed: Duration,
}

/// Per-run usage accumulator shared by all workers of one experiment.
#[derive(Debug, Default)]
pub struct UsageMetrics {
    by_purpose: DashMap<Purpose, UsageTotals>,
}

impl UsageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, purpose: Purpose, prompt_tokens: u64, completion_tokens: u64, elapsed: Duration) {
        let mut totals = self.by_purpose.entry(purpose).or_default();
        totals.calls += 1;
        totals.prompt_tokens += prompt_tokens;
        totals.completion_tokens += completion_tokens;
        totals.elapsed += elapsed;
    }

    pub fn get(&self, purpose: Purpose) -> UsageTotals {
        self.by_purpose
            .get(&purpose)
            .map(|t| *t.value())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<Purpose, UsageTotals> {
        self.by_purpose
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn total(&self) -> UsageTotals {
        self.by_purpose
            .iter()
            .fold(UsageTotals::default(), |mut acc, entry| {
                acc.calls += entry.calls;
                acc.prompt_tokens += entry.prompt_tokens;
                acc.completion_tokens += entry.completion_tokens;
                acc.elapsed += entry.elapsed;
                acc
            })
    }

    /// Emit one log line per purpose.
    pub fn log_summary(&self) {
        for (purpose, totals) in self.snapshot() {
            tracing::info!(
                ?purpose,
                calls = totals.calls,
                prompt_tokens = totals.prompt_tokens,
                completion_tokens = totals.completion_tokens,
                elapsed_ms = totals.elapsed.as_millis() as u64,
                "collaborator usage"
            );
        }
    }
}

/// What every collaborator call can see.
#[derive(Clone, Copy)]
pub struct CollabContext<'a> {
    pub store: &'a KnowledgeStore,
    pub metrics: &'a UsageMetrics,
    pub top_k: usize,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// A mined unit plus the novelty flags the redundancy pass needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub unit: KnowledgeUnit,
    pub new_values: NewValueFlags,
    pub new_function: bool,
}

/// Mines a knowledge unit from one segment's rows.
pub trait Extractor: Send + Sync {
    /// `Ok` with `unit.v_b == None` means "no behaviour found", not a failure.
    fn extract(&self, ctx: &CollabContext<'_>, task: &Task) -> CollabResult<Extraction>;
}

/// Decides which pattern terms and functions of a batch are redundant.
pub trait Deduplicator: Send + Sync {
    fn analyze(&self, ctx: &CollabContext<'_>, request: &DedupRequest)
    -> CollabResult<RedundancyDecisions>;
}

// ---------------------------------------------------------------------------
// Imputation chain
// ---------------------------------------------------------------------------

/// Input shared by the three imputation stages.
#[derive(Debug, Clone)]
pub struct ImputationRequest {
    pub sequence_id: u64,
    pub segment_id: usize,
    pub mmsi: Option<u64>,
    /// Previous, current (positions cleared) and next segment.
    pub rows: Vec<TrajectoryRow>,
    pub neighbors: Vec<KnowledgeUnit>,
    pub behavior_candidates: Vec<BehaviorCandidate>,
}

/// Estimate → select → explain.
pub trait ImputationCollaborator: Send + Sync {
    fn estimate(
        &self,
        ctx: &CollabContext<'_>,
        request: &ImputationRequest,
    ) -> CollabResult<BehaviorSelection>;

    fn select(
        &self,
        ctx: &CollabContext<'_>,
        request: &ImputationRequest,
        behavior: &BehaviorSelection,
        functions: &[FunctionCandidate],
    ) -> CollabResult<MethodSelection>;

    fn explain(
        &self,
        ctx: &CollabContext<'_>,
        request: &ImputationRequest,
        behavior: &BehaviorSelection,
        method: &MethodSelection,
        subgraph_dot: &str,
    ) -> CollabResult<Explanation>;

    /// Run the chosen function over the gap. Defaults to no points.
    fn apply(
        &self,
        _request: &ImputationRequest,
        _method: &MethodSelection,
    ) -> CollabResult<Vec<ImputedPoint>> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Serves pre-extracted units keyed by `(sequence, segment)`.
///
/// A served behaviour without a duration gets the bucket of the task's rows,
/// and a unit without a function gets the behaviour's heaviest stored one.
#[derive(Debug, Clone, Default)]
pub struct ReplayExtractor {
    units: HashMap<(u64, usize), KnowledgeUnit>,
}

impl ReplayExtractor {
    /// Units are keyed by their `seq` and `block` attributes; units without
    /// both are dropped.
    pub fn new(units: impl IntoIterator<Item = KnowledgeUnit>) -> Self {
        let units = units
            .into_iter()
            .filter_map(|u| {
                let key = (u.v_s.sequence()?, u.v_s.block()? as usize);
                Some((key, u))
            })
            .collect();
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Extractor for ReplayExtractor {
    fn extract(&self, ctx: &CollabContext<'_>, task: &Task) -> CollabResult<Extraction> {
        let Some(unit) = self.units.get(&(task.sequence_id, task.segment_id)) else {
            return Ok(Extraction::default());
        };
        let mut unit = unit.clone();
        if let Some(vb) = unit.v_b.as_mut()
            && vb.duration.is_none()
            && !task.rows().is_empty()
        {
            vb.duration = Some(duration_bucket(task.rows()));
        }
        // A unit recorded without a function reuses the heaviest stored one.
        if unit.v_f.is_none()
            && let Some((vf, node)) = unit.v_b.as_ref().and_then(|vb| ctx.store.best_function_for(vb))
        {
            unit.v_f = Some(SpatialFunction {
                vf_id: Some(vf),
                ..SpatialFunction::new(node.description, node.code)
            });
        }
        let new_values = unit
            .v_b
            .as_ref()
            .map(|vb| ctx.store.register_patterns(vb))
            .unwrap_or_default();
        let new_function = unit
            .v_f
            .as_ref()
            .and_then(|vf| vf.id())
            .is_some_and(|id| !ctx.store.function_exists(id));
        Ok(Extraction {
            unit,
            new_values,
            new_function,
        })
    }
}

/// Declares nothing redundant.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRedundancy;

impl Deduplicator for NoRedundancy {
    fn analyze(
        &self,
        _ctx: &CollabContext<'_>,
        _request: &DedupRequest,
    ) -> CollabResult<RedundancyDecisions> {
        Ok(RedundancyDecisions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BehaviorPattern, StaticAttributes};
    use crate::task::TaskKind;
    use crate::trajectory::TrajectoryRow;

    #[test]
    fn metrics_accumulate_per_purpose() {
        let metrics = UsageMetrics::new();
        metrics.record(Purpose::Pattern, 100, 20, Duration::from_millis(5));
        metrics.record(Purpose::Pattern, 50, 10, Duration::from_millis(5));
        metrics.record(Purpose::Selection, 7, 3, Duration::from_millis(1));
        let pattern = metrics.get(Purpose::Pattern);
        assert_eq!(pattern.calls, 2);
        assert_eq!(pattern.prompt_tokens, 150);
        assert_eq!(metrics.total().completion_tokens, 33);
        assert_eq!(metrics.snapshot().len(), 2);
        assert_eq!(metrics.get(Purpose::Explanation), UsageTotals::default());
    }

    #[test]
    fn replay_extractor_serves_by_sequence_and_block() {
        let unit = KnowledgeUnit {
            v_s: StaticAttributes::new().with("seq", 4).with("block", 2),
            v_b: Some(BehaviorPattern {
                speed_profile: Some("slow".into()),
                ..Default::default()
            }),
            v_f: Some(SpatialFunction::new("linear", "def f(): pass")),
        };
        let extractor = ReplayExtractor::new([unit.clone(), KnowledgeUnit::placeholder()]);
        assert_eq!(extractor.len(), 1);

        let store = KnowledgeStore::new();
        let metrics = UsageMetrics::new();
        let ctx = CollabContext {
            store: &store,
            metrics: &metrics,
            top_k: 3,
        };
        let task = |segment_id| Task {
            seq_idx: 0,
            sequence_id: 4,
            segment_id,
            mmsi: None,
            kind: TaskKind::Process { rows: Vec::new() },
            retry_count: 0,
        };
        let hit = extractor.extract(&ctx, &task(2)).unwrap();
        assert_eq!(hit.unit, unit);
        assert!(hit.new_values.speed_profile);
        assert!(hit.new_function);

        let miss = extractor.extract(&ctx, &task(3)).unwrap();
        assert!(miss.unit.v_b.is_none());
    }

    #[test]
    fn replay_fills_duration_and_reuses_stored_function() {
        let pattern = BehaviorPattern {
            speed_profile: Some("slow".into()),
            intent: Some("transit".into()),
            ..Default::default()
        };
        let store = KnowledgeStore::new();
        let stored = SpatialFunction::new("hold", "def hold(p):\n    return p");
        let with_duration = |d: &str| BehaviorPattern {
            duration: Some(d.into()),
            ..pattern.clone()
        };
        store.update_graph(&KnowledgeUnit {
            v_s: StaticAttributes::new().with("vessel_type", "Cargo"),
            v_b: Some(with_duration("100~150")),
            v_f: Some(stored.clone()),
        });

        let extractor = ReplayExtractor::new([KnowledgeUnit {
            v_s: StaticAttributes::new().with("seq", 1).with("block", 0),
            v_b: Some(pattern.clone()),
            v_f: None,
        }]);
        let rows: Vec<TrajectoryRow> = ["10:00:00", "10:02:00"]
            .iter()
            .map(|t| TrajectoryRow {
                sequence_id: 1,
                segment_id: 0,
                mmsi: 7,
                timestamp: format!("2024-03-01 {t}"),
                latitude: Some(55.0),
                longitude: Some(12.0),
                sog: None,
                cog: None,
                heading: None,
            })
            .collect();
        let task = Task {
            seq_idx: 0,
            sequence_id: 1,
            segment_id: 0,
            mmsi: Some(7),
            kind: TaskKind::Process { rows },
            retry_count: 0,
        };
        let metrics = UsageMetrics::new();
        let ctx = CollabContext {
            store: &store,
            metrics: &metrics,
            top_k: 3,
        };

        let served = extractor.extract(&ctx, &task).unwrap();
        assert_eq!(served.unit.v_b, Some(with_duration("100~150")));
        let vf = served.unit.v_f.unwrap();
        assert_eq!(vf.code, stored.code);
        assert_eq!(vf.vf_id, stored.id());
        assert!(!served.new_function);
    }
}
