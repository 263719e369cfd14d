//! Segment tasks and the task builder.
//!
//! The builder expands a trajectory table and its missing mask into one task
//! per `(sequence, segment)` pair. Schedulers treat the returned list as a
//! stack, so the last task built is the first processed.

use std::collections::{HashMap, HashSet};

use crate::error::{PipelineError, PipelineResult};
use crate::trajectory::{MissingMask, TrajectoryRow, TrajectoryTable};

/// What a scheduler does with a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Segment is not missing; nothing to impute.
    Skip,
    /// Segment is wholly missing; contributes a placeholder without dispatch.
    Empty,
    /// Dispatched to a worker with these rows.
    Process { rows: Vec<TrajectoryRow> },
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Skip => "skip",
            TaskKind::Empty => "empty",
            TaskKind::Process { .. } => "process",
        }
    }
}

/// One schedulable unit of work. Only `retry_count` changes after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Index of the sequence within the processed window (mask row).
    pub seq_idx: usize,
    pub sequence_id: u64,
    pub segment_id: usize,
    /// Vessel of the segment, when the table has rows for it.
    pub mmsi: Option<u64>,
    pub kind: TaskKind,
    pub retry_count: u32,
}

impl Task {
    pub fn rows(&self) -> &[TrajectoryRow] {
        match &self.kind {
            TaskKind::Process { rows } => rows,
            _ => &[],
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self.kind, TaskKind::Process { .. })
    }
}

/// Which pipeline the tasks are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Missing segments become `Empty`, present ones are processed.
    GraphConstruction,
    /// Missing segments are processed with their neighbours, present ones skipped.
    Imputation,
}

/// Expand `(table, mask)` into segment tasks in table order.
///
/// `sequence_ids[i]` is looked up in mask row `i`.
pub fn build_segment_tasks(
    table: &TrajectoryTable,
    sequence_ids: &[u64],
    mask: &MissingMask,
    mode: BuildMode,
) -> PipelineResult<Vec<Task>> {
    let local: HashMap<u64, usize> = sequence_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    let wanted: HashSet<u64> = sequence_ids.iter().copied().collect();
    let (rows, cols) = mask.dims();

    let mut tasks = Vec::new();
    for (sequence_id, segment_id) in table.segment_pairs(&wanted) {
        let seq_idx = local[&sequence_id];
        let missing = mask
            .get(seq_idx, segment_id)
            .ok_or(PipelineError::MaskOutOfRange {
                seq_idx,
                segment_id,
                rows,
                cols,
            })?;

        let segment_rows = table.segment_rows(sequence_id, segment_id);
        let mmsi = segment_rows.first().map(|r| r.mmsi);
        let kind = match (mode, missing) {
            (BuildMode::GraphConstruction, true) => TaskKind::Empty,
            (BuildMode::GraphConstruction, false) => TaskKind::Process { rows: segment_rows },
            (BuildMode::Imputation, true) => TaskKind::Process {
                rows: table.masked_window(sequence_id, segment_id),
            },
            (BuildMode::Imputation, false) => TaskKind::Skip,
        };
        tasks.push(Task {
            seq_idx,
            sequence_id,
            segment_id,
            mmsi,
            kind,
            retry_count: 0,
        });
    }

    tracing::debug!(
        tasks = tasks.len(),
        dispatched = tasks.iter().filter(|t| t.is_dispatched()).count(),
        ?mode,
        "segment tasks built"
    );
    Ok(tasks)
}
