//! Trajectory rows, the segmented trajectory table and the missing mask.
//!
//! Acquisition, cleaning and segmentation happen upstream; this module only
//! holds their output in the shape the task builder consumes.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// One AIS point after segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRow {
    pub sequence_id: u64,
    pub segment_id: usize,
    pub mmsi: u64,
    /// `YYYY-MM-DD HH:MM:SS` or RFC 3339.
    pub timestamp: String,
    /// `None` when the position is being imputed.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub sog: Option<f64>,
    #[serde(default)]
    pub cog: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
}

impl TrajectoryRow {
    /// One-line textual rendering of the point, with `nan` for missing
    /// values. Collaborator implementations use it to describe a segment.
    pub fn dynamic_info(&self) -> String {
        fn opt(v: Option<f64>) -> String {
            v.map(|x| x.to_string()).unwrap_or_else(|| "nan".into())
        }
        format!(
            "timestamp: {},latitude: {}, longitude: {}, sog: {}, cog: {}, heading: {}",
            self.timestamp,
            opt(self.latitude),
            opt(self.longitude),
            opt(self.sog),
            opt(self.cog),
            opt(self.heading)
        )
    }

    /// Parsed timestamp, if it is in a recognised format.
    pub fn parsed_timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%d %H:%M:%S")
            .ok()
            .or_else(|| {
                DateTime::parse_from_rfc3339(&self.timestamp)
                    .ok()
                    .map(|dt| dt.naive_utc())
            })
    }
}

/// The segmented trajectory table, rows in dataset order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryTable {
    pub rows: Vec<TrajectoryRow>,
}

impl TrajectoryTable {
    pub fn new(rows: Vec<TrajectoryRow>) -> Self {
        Self { rows }
    }

    /// Distinct sequence ids in order of first appearance.
    pub fn sequence_ids(&self) -> Vec<u64> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|r| seen.insert(r.sequence_id))
            .map(|r| r.sequence_id)
            .collect()
    }

    /// Distinct `(sequence, segment)` pairs among `sequences`, in order of first appearance.
    pub fn segment_pairs(&self, sequences: &HashSet<u64>) -> Vec<(u64, usize)> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|r| sequences.contains(&r.sequence_id))
            .map(|r| (r.sequence_id, r.segment_id))
            .filter(|pair| seen.insert(*pair))
            .collect()
    }

    /// Rows of one segment.
    pub fn segment_rows(&self, sequence_id: u64, segment_id: usize) -> Vec<TrajectoryRow> {
        self.rows
            .iter()
            .filter(|r| r.sequence_id == sequence_id && r.segment_id == segment_id)
            .cloned()
            .collect()
    }

    /// Rows of the previous, current and next segment with the current
    /// segment's positions cleared.
    pub fn masked_window(&self, sequence_id: u64, segment_id: usize) -> Vec<TrajectoryRow> {
        let lo = segment_id.saturating_sub(1);
        let hi = segment_id + 1;
        self.rows
            .iter()
            .filter(|r| r.sequence_id == sequence_id && (lo..=hi).contains(&r.segment_id))
            .map(|r| {
                let mut row = r.clone();
                if row.segment_id == segment_id {
                    row.latitude = None;
                    row.longitude = None;
                }
                row
            })
            .collect()
    }
}

/// `mask[local_sequence][segment] == true` marks a wholly missing segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingMask {
    pub rows: Vec<Vec<bool>>,
}

impl MissingMask {
    pub fn new(rows: Vec<Vec<bool>>) -> Self {
        Self { rows }
    }

    /// Build from a 0/1 matrix.
    pub fn from_bits(bits: &[Vec<u8>]) -> Self {
        Self {
            rows: bits
                .iter()
                .map(|r| r.iter().map(|b| *b == 1).collect())
                .collect(),
        }
    }

    pub fn get(&self, seq_idx: usize, segment_id: usize) -> Option<bool> {
        self.rows.get(seq_idx)?.get(segment_id).copied()
    }

    /// Rows `start..end`, the window matching the processed sequences.
    pub fn window(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.rows.len());
        let start = start.min(end);
        Self {
            rows: self.rows[start..end].to_vec(),
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        (
            self.rows.len(),
            self.rows.iter().map(Vec::len).max().unwrap_or(0),
        )
    }
}

/// Seconds assumed between points when timestamps are unusable.
const SECONDS_PER_POINT: f64 = 60.0;
/// Width of a duration bucket in seconds.
const DURATION_STEP: u64 = 50;

/// Discretised segment duration, e.g. `"100~150"`.
pub fn duration_bucket(rows: &[TrajectoryRow]) -> String {
    let stamps: Vec<NaiveDateTime> = rows.iter().filter_map(|r| r.parsed_timestamp()).collect();
    let seconds = match (stamps.first(), stamps.last()) {
        (Some(first), Some(last)) if stamps.len() >= 2 => {
            (*last - *first).num_milliseconds() as f64 / 1000.0
        }
        _ => rows.len() as f64 * SECONDS_PER_POINT,
    };
    let lower = (seconds.max(0.0) as u64 / DURATION_STEP) * DURATION_STEP;
    format!("{}~{}", lower, lower + DURATION_STEP)
}
