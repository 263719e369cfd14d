//! End-to-end tests for graph construction and imputation.
//!
//! Collaborators are scripted so every run is deterministic: the extractor
//! derives its knowledge unit from the task, the deduplicator folds by rule,
//! and the imputation collaborator picks the top-ranked candidates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vista_kg::collab::{
    CollabContext, CollabResult, CollaboratorError, Deduplicator, Extraction, Extractor,
    ImputationCollaborator, ImputationRequest, NoRedundancy,
};
use vista_kg::config::ExperimentConfig;
use vista_kg::experiment::Experiment;
use vista_kg::graph::store::FunctionCandidate;
use vista_kg::graph::{BehaviorPattern, FunctionId, SpatialFunction, StaticAttributes};
use vista_kg::ledger::{BehaviorSelection, Explanation, MethodSelection};
use vista_kg::redundancy::{DedupRequest, RedundancyDecisions};
use vista_kg::task::Task;
use vista_kg::trajectory::{MissingMask, TrajectoryRow, TrajectoryTable};

const SEQ_A: u64 = 100;
const SEQ_B: u64 = 200;

fn mmsi_of(seq: u64) -> u64 {
    219_000_000 + seq
}

fn row(seq: u64, seg: usize, minute: usize) -> TrajectoryRow {
    TrajectoryRow {
        sequence_id: seq,
        segment_id: seg,
        mmsi: mmsi_of(seq),
        timestamp: format!("2024-03-01 10:{:02}:00", seg * 10 + minute),
        latitude: Some(55.0 + seg as f64 * 0.01),
        longitude: Some(12.0 + minute as f64 * 0.01),
        sog: Some(8.5),
        cog: Some(90.0),
        heading: Some(91.0),
    }
}

/// Two trajectories of two segments, two points each.
fn table() -> TrajectoryTable {
    let mut rows = Vec::new();
    for seq in [SEQ_A, SEQ_B] {
        for seg in 0..2 {
            for minute in 0..2 {
                rows.push(row(seq, seg, minute));
            }
        }
    }
    TrajectoryTable::new(rows)
}

fn config(dir: &std::path::Path, max_concurrent: usize) -> ExperimentConfig {
    ExperimentConfig {
        results_root: dir.to_path_buf(),
        trajectory_len: 40,
        mini_segment_len: 20,
        check_point: 0,
        end_point: 2,
        end_point_graph: 2,
        process_length: 1,
        max_concurrent,
        max_retries: 2,
        task_timeout_secs: 60,
        ..ExperimentConfig::with_name("it")
    }
}

fn vessel_type(seq: u64) -> &'static str {
    if seq == SEQ_A { "Cargo" } else { "Tanker" }
}

fn speed_for(task: &Task) -> &'static str {
    match (task.sequence_id, task.segment_id) {
        (SEQ_A, 0) => "slow (3 kn)",
        (SEQ_B, 0) => "Slow: steady",
        _ => "moderate",
    }
}

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Builds a unit from the task; fails forever on the segments in `failing`.
#[derive(Default)]
struct ScriptedExtractor {
    failing: Vec<(u64, usize)>,
    calls: Mutex<HashMap<(u64, usize), usize>>,
}

impl ScriptedExtractor {
    fn failing_on(seq: u64, seg: usize) -> Self {
        Self {
            failing: vec![(seq, seg)],
            ..Default::default()
        }
    }

    fn calls(&self, seq: u64, seg: usize) -> usize {
        self.calls.lock().unwrap().get(&(seq, seg)).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Extractor for ScriptedExtractor {
    fn extract(&self, ctx: &CollabContext<'_>, task: &Task) -> CollabResult<Extraction> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry((task.sequence_id, task.segment_id))
            .or_default() += 1;
        if self.failing.contains(&(task.sequence_id, task.segment_id)) {
            return Err(CollaboratorError::failed("scripted outage"));
        }

        let pattern = BehaviorPattern {
            speed_profile: Some(speed_for(task).into()),
            intent: Some("transit".into()),
            rationale: format!("{} rows", task.rows().len()),
            ..Default::default()
        };
        let new_values = ctx.store.register_patterns(&pattern);
        let function = SpatialFunction::new(
            format!("linear fill for segment {}", task.segment_id),
            format!("def fill_{}(points):\n    return points", task.segment_id),
        );
        let new_function = function.id().is_some_and(|id| !ctx.store.function_exists(id));
        let v_s = StaticAttributes::new()
            .with("vessel_type", vessel_type(task.sequence_id))
            .with("MMSI", task.mmsi.unwrap_or_default())
            .with("seq", task.sequence_id)
            .with("block", task.segment_id as u64);

        Ok(Extraction {
            unit: vista_kg::graph::KnowledgeUnit {
                v_s,
                v_b: Some(pattern),
                v_f: Some(function),
            },
            new_values,
            new_function,
        })
    }
}

/// Declares every function of the request redundant with the first one.
struct FoldAllFunctions;

impl Deduplicator for FoldAllFunctions {
    fn analyze(&self, _ctx: &CollabContext<'_>, request: &DedupRequest) -> CollabResult<RedundancyDecisions> {
        let mut decisions = RedundancyDecisions::default();
        if let Some((first, rest)) = request.functions.split_first() {
            for sample in rest {
                decisions.functions.insert(sample.reference, first.reference);
            }
        }
        Ok(decisions)
    }
}

/// Answers with a fixed text response.
struct TextDeduplicator(&'static str);

impl Deduplicator for TextDeduplicator {
    fn analyze(&self, _ctx: &CollabContext<'_>, _request: &DedupRequest) -> CollabResult<RedundancyDecisions> {
        Ok(RedundancyDecisions::parse(self.0))
    }
}

/// Picks the top candidates; for `bad_sequence` it names a function the
/// store does not have.
struct TopCandidate {
    bad_sequence: Option<u64>,
    selects: Mutex<HashMap<u64, usize>>,
}

impl TopCandidate {
    fn new(bad_sequence: Option<u64>) -> Self {
        Self {
            bad_sequence,
            selects: Mutex::new(HashMap::new()),
        }
    }

    fn selects(&self, seq: u64) -> usize {
        self.selects.lock().unwrap().get(&seq).copied().unwrap_or(0)
    }
}

impl ImputationCollaborator for TopCandidate {
    fn estimate(&self, _ctx: &CollabContext<'_>, request: &ImputationRequest) -> CollabResult<BehaviorSelection> {
        Ok(BehaviorSelection {
            selected_movement_id: request.behavior_candidates.first().map(|c| c.id),
            graph_support: format!("{} candidates", request.behavior_candidates.len()),
            contextual_justification: format!("{} neighbours", request.neighbors.len()),
        })
    }

    fn select(
        &self,
        _ctx: &CollabContext<'_>,
        request: &ImputationRequest,
        _behavior: &BehaviorSelection,
        functions: &[FunctionCandidate],
    ) -> CollabResult<MethodSelection> {
        *self
            .selects
            .lock()
            .unwrap()
            .entry(request.sequence_id)
            .or_default() += 1;
        let selected = if self.bad_sequence == Some(request.sequence_id) {
            Some(FunctionId::from_raw(0xdead_beef))
        } else {
            functions.first().map(|c| c.id)
        };
        Ok(MethodSelection {
            selected_function_id: selected,
            statistical_support: String::new(),
            reasoning: "highest weight".into(),
            imputation_action: "fill".into(),
        })
    }

    fn explain(
        &self,
        _ctx: &CollabContext<'_>,
        _request: &ImputationRequest,
        _behavior: &BehaviorSelection,
        _method: &MethodSelection,
        subgraph_dot: &str,
    ) -> CollabResult<Explanation> {
        Ok(Explanation {
            regulatory_rule_cue: "COLREG rule 6".into(),
            operational_protocol_rationale: subgraph_dot.to_string(),
        })
    }
}

fn full_mask() -> MissingMask {
    MissingMask::new(vec![vec![false, false], vec![false, false]])
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

#[test]
fn missing_segment_never_reaches_extractor() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();
    let extractor = Arc::new(ScriptedExtractor::default());
    let mask = MissingMask::new(vec![vec![false, true], vec![false, false]]);

    let report = exp
        .construct_graph(&table(), &mask, extractor.clone(), Arc::new(NoRedundancy))
        .unwrap();

    assert_eq!(extractor.calls(SEQ_A, 1), 0);
    assert_eq!(extractor.total_calls(), 3);
    assert_eq!(report.short_circuited, 1);
    assert_eq!(exp.knowledge().len(), 4);
    let placeholders = exp
        .knowledge()
        .entries()
        .iter()
        .filter(|u| u.v_b.is_none() && u.v_s.is_empty())
        .count();
    assert_eq!(placeholders, 1);
}

#[test]
fn parenthetical_suffixes_share_one_behaviour() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();

    exp.construct_graph(&table(), &full_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(NoRedundancy))
        .unwrap();

    // "slow (3 kn)" and "Slow: steady" collapse; "moderate" stays apart.
    let stats = exp.store().stats();
    assert_eq!(stats.behavior_nodes, 2);
    assert_eq!(stats.function_nodes, 2);

    // Cargo reaches "slow" through A/0 and "moderate" through A/1.
    let query = StaticAttributes::new().with("vessel_type", "Cargo");
    let ranked = exp.store().select_behavior_candidates(&[&query], 5);
    assert_eq!(ranked.len(), 2);
    assert!((ranked[0].score + ranked[1].score - 1.0).abs() < 1e-9);
    assert!((ranked[0].score - ranked[1].score).abs() < 1e-9);
}

#[test]
fn failing_segment_retries_to_ceiling_then_records_placeholder() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();
    let extractor = Arc::new(ScriptedExtractor::failing_on(SEQ_B, 1));

    let report = exp
        .construct_graph(&table(), &full_mask(), extractor.clone(), Arc::new(NoRedundancy))
        .unwrap();

    // One initial attempt plus `max_retries` retries.
    assert_eq!(extractor.calls(SEQ_B, 1), 3);
    assert_eq!(report.retried, 2);
    assert_eq!(report.gave_up, 1);
    assert_eq!(report.accepted, 3);
    assert_eq!(exp.knowledge().len(), 4);
    assert_eq!(
        exp.knowledge().entries().iter().filter(|u| u.v_b.is_none()).count(),
        1
    );
}

#[test]
fn redundant_functions_fold_into_one_node() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();

    exp.construct_graph(&table(), &full_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(FoldAllFunctions))
        .unwrap();

    let functions = exp.store().function_nodes();
    assert_eq!(functions.len(), 1);
    let (id, _) = functions.into_iter().next().unwrap();
    let links = exp.store().function_links(id).unwrap();
    assert_eq!(links.values().sum::<u64>(), 4);
}

#[test]
fn text_redundancy_response_rewrites_terms_before_commit() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();
    let response = "BEHAVIOR_REDUNDANCY:\nspeed_profile:\n- slow | [moderate]\nKEEP_UNIQUE: []\n\
                    FUNCTION_REDUNDANCY:\nKEEP_UNIQUE: []\n";

    exp.construct_graph(
        &table(),
        &full_mask(),
        Arc::new(ScriptedExtractor::default()),
        Arc::new(TextDeduplicator(response)),
    )
    .unwrap();

    assert_eq!(exp.store().stats().behavior_nodes, 1);
    let dictionaries = exp.store().dictionaries();
    assert!(!dictionaries.contains(vista_kg::graph::PatternField::Speed, "moderate"));
    // The ledger keeps what the extractor produced.
    assert!(
        exp.knowledge()
            .entries()
            .iter()
            .any(|u| u.v_b.as_ref().and_then(|b| b.speed_profile.as_deref()) == Some("moderate"))
    );
}

#[test]
fn checkpoints_follow_trajectory_count() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 1)).unwrap();

    let report = exp
        .construct_graph(&table(), &full_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(NoRedundancy))
        .unwrap();

    assert_eq!(report.checkpoints, vec![1, 2]);
    let graph_dir = &exp.paths().graph_dir;
    for tag in [1, 2] {
        assert!(graph_dir.join(format!("behavior_nodes_{tag}.json")).is_file());
        assert!(exp.knowledge().path(tag).is_file());
    }
}

#[test]
fn batch_checkpoint_lands_on_reached_tag() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();

    let report = exp
        .construct_graph(&table(), &full_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(NoRedundancy))
        .unwrap();

    assert_eq!(report.checkpoints, vec![2]);
    assert!(!exp.knowledge().path(1).exists());
}

// ---------------------------------------------------------------------------
// Imputation
// ---------------------------------------------------------------------------

/// `A/1` and `B/0` are missing.
fn gap_mask() -> MissingMask {
    MissingMask::new(vec![vec![false, true], vec![true, false]])
}

#[test]
fn imputation_uses_neighbours_and_rejects_unknown_functions() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();
    exp.construct_graph(&table(), &gap_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(NoRedundancy))
        .unwrap();

    let collaborator = TopCandidate::new(Some(SEQ_B));
    let report = exp.impute(&table(), &gap_mask(), &collaborator).unwrap();

    assert_eq!(report.short_circuited, 2);
    assert_eq!(report.gave_up, 1);
    assert_eq!(collaborator.selects(SEQ_B), 3);
    assert_eq!(collaborator.selects(SEQ_A), 1);
    assert_eq!(exp.results().len(), 4);

    let imputed = exp
        .results()
        .entries()
        .iter()
        .find(|r| r.sequence_id == SEQ_A && r.segment_id == 1)
        .unwrap();
    assert_eq!(imputed.mmsi, Some(mmsi_of(SEQ_A)));
    let selected = imputed
        .method_selector
        .as_ref()
        .and_then(|m| m.selected_function_id)
        .unwrap();
    assert!(exp.store().function_exists(selected));
    let slow = exp.store().function_node(selected).unwrap();
    assert!(slow.code.contains("fill_0"));
    let dot = &imputed.explanation_composer.as_ref().unwrap().operational_protocol_rationale;
    assert!(dot.contains("digraph"));
    assert!(dot.contains(&selected.to_string()));

    let gave_up = exp
        .results()
        .entries()
        .iter()
        .find(|r| r.sequence_id == SEQ_B && r.segment_id == 0)
        .unwrap();
    assert!(gave_up.is_empty());
}

#[test]
fn skip_segments_are_recorded_without_dispatch() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();
    exp.construct_graph(&table(), &full_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(NoRedundancy))
        .unwrap();

    let collaborator = TopCandidate::new(None);
    let report = exp.impute(&table(), &full_mask(), &collaborator).unwrap();

    assert_eq!(report.dispatched, 0);
    assert_eq!(report.short_circuited, 4);
    assert_eq!(collaborator.selects(SEQ_A) + collaborator.selects(SEQ_B), 0);
    assert!(exp.results().entries().iter().all(|r| r.is_empty()));
    assert_eq!(report.checkpoints, vec![2]);
}

#[test]
fn rerun_reuses_saved_graph_and_results() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();
        let summary = exp
            .run(
                &table(),
                &gap_mask(),
                Arc::new(ScriptedExtractor::default()),
                Arc::new(NoRedundancy),
                &TopCandidate::new(None),
            )
            .unwrap();
        assert!(summary.construction.is_some());
        assert!(summary.imputation.is_some());
    }

    let mut exp = Experiment::new(config(dir.path(), 4)).unwrap();
    let extractor = Arc::new(ScriptedExtractor::default());
    let collaborator = TopCandidate::new(None);
    let summary = exp
        .run(&table(), &gap_mask(), extractor.clone(), Arc::new(NoRedundancy), &collaborator)
        .unwrap();

    assert!(summary.construction.is_none());
    assert!(summary.imputation.is_none());
    assert_eq!(extractor.total_calls(), 0);
    assert_eq!(exp.knowledge().len(), 4);
    assert_eq!(exp.results().len(), 4);
    assert_eq!(exp.store().stats().behavior_nodes, 2);
}

fn window(dir: &std::path::Path, check_point: u64, end_point: u64) -> ExperimentConfig {
    ExperimentConfig {
        check_point,
        end_point,
        ..config(dir, 4)
    }
}

#[test]
fn construction_resumes_from_check_point() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let mut first = Experiment::new(window(dir.path(), 0, 1)).unwrap();
        let report = first
            .construct_graph(&table(), &full_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(NoRedundancy))
            .unwrap();
        assert_eq!(report.checkpoints, vec![1]);
    }

    let mut second = Experiment::new(window(dir.path(), 1, 2)).unwrap();
    let extractor = Arc::new(ScriptedExtractor::default());
    let report = second
        .construct_graph(&table(), &full_mask(), extractor.clone(), Arc::new(NoRedundancy))
        .unwrap();
    assert_eq!(report.checkpoints, vec![2]);
    assert_eq!(extractor.calls(SEQ_A, 0), 0);
    assert_eq!(extractor.calls(SEQ_B, 0), 1);

    let mut reopened = Experiment::new(window(dir.path(), 0, 2)).unwrap();
    let summary = reopened.load(2).unwrap();
    assert!(summary.graph.is_complete());
    assert_eq!(summary.knowledge_units, Some(4));
    let sequences: Vec<_> = reopened
        .knowledge()
        .entries()
        .iter()
        .filter_map(|u| u.v_s.sequence())
        .collect();
    assert_eq!(sequences.iter().filter(|s| **s == SEQ_A).count(), 2);
    assert_eq!(sequences.iter().filter(|s| **s == SEQ_B).count(), 2);

    for vessel in ["Cargo", "Tanker"] {
        let query = StaticAttributes::new().with("vessel_type", vessel);
        assert!(!reopened.store().select_behavior_candidates(&[&query], 5).is_empty(), "{vessel}");
    }
}

#[test]
fn imputation_resumes_from_check_point() {
    let dir = tempfile::TempDir::new().unwrap();
    Experiment::new(window(dir.path(), 0, 2))
        .unwrap()
        .construct_graph(&table(), &full_mask(), Arc::new(ScriptedExtractor::default()), Arc::new(NoRedundancy))
        .unwrap();

    {
        let mut first = Experiment::new(window(dir.path(), 0, 1)).unwrap();
        first.load(2).unwrap();
        let report = first.impute(&table(), &gap_mask(), &TopCandidate::new(None)).unwrap();
        assert_eq!(report.checkpoints, vec![1]);
    }

    let mut second = Experiment::new(window(dir.path(), 1, 2)).unwrap();
    second.store().load(&second.paths().graph_dir, 2).unwrap();
    let collaborator = TopCandidate::new(None);
    let report = second.impute(&table(), &gap_mask(), &collaborator).unwrap();
    assert_eq!(report.checkpoints, vec![2]);
    assert_eq!(collaborator.selects(SEQ_A), 0);
    assert_eq!(second.results().len(), 4);
    assert_eq!(second.results().entries()[0].sequence_id, SEQ_A);
    assert!(second.results().path(2).exists());
}
