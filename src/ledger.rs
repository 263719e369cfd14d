//! Append-only ledgers of accepted task output, checkpointed to JSON.
//!
//! Two ledgers exist per experiment: knowledge units (graph construction)
//! and imputation results. A ledger's length divided by the segments per
//! trajectory is the number of finished trajectories, which is what
//! checkpoint tags count.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::graph::persist::{checkpoint_path, read_json_optional, write_json_atomic};
use crate::graph::{BehaviorId, FunctionId, KnowledgeUnit};

/// File-name prefix of the knowledge-unit ledger.
pub const KNOWLEDGE_PREFIX: &str = "knowledge_units";
/// File-name prefix of the imputation-result ledger.
pub const IMPUTATION_PREFIX: &str = "imputation_results";

/// An append-only list with tag-keyed checkpoint files.
#[derive(Debug, Clone)]
pub struct Ledger<T> {
    dir: PathBuf,
    stem: String,
    entries: Vec<T>,
}

impl<T: Serialize + DeserializeOwned> Ledger<T> {
    /// A ledger whose checkpoints are `<dir>/<stem>_<tag>.json`.
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.last()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, tag: u64) -> PathBuf {
        checkpoint_path(&self.dir, &self.stem, tag)
    }

    pub fn save(&self, tag: u64) -> StoreResult<()> {
        write_json_atomic(&self.path(tag), &self.entries)?;
        tracing::info!(tag, entries = self.entries.len(), stem = %self.stem, "ledger saved");
        Ok(())
    }

    /// Replace the entries with checkpoint `tag`. Returns `false` and keeps
    /// the current entries when the file does not exist.
    pub fn load(&mut self, tag: u64) -> StoreResult<bool> {
        let path = self.path(tag);
        match read_json_optional::<Vec<T>>(&path)? {
            Some(entries) => {
                tracing::info!(tag, entries = entries.len(), stem = %self.stem, "ledger loaded");
                self.entries = entries;
                Ok(true)
            }
            None => {
                tracing::warn!(path = %path.display(), "ledger checkpoint missing");
                Ok(false)
            }
        }
    }
}

pub type KnowledgeLedger = Ledger<KnowledgeUnit>;
pub type ImputationLedger = Ledger<ImputationResult>;

impl Ledger<KnowledgeUnit> {
    /// Units mined from the segments around `segment` of the same vessel and
    /// sequence: the immediate neighbours when either exists, otherwise the
    /// two nearest segments.
    pub fn neighbor_context(&self, mmsi: u64, sequence: u64, segment: usize) -> Vec<KnowledgeUnit> {
        let segment = segment as u64;
        let mut same_track: Vec<(u64, &KnowledgeUnit)> = self
            .entries
            .iter()
            .filter(|u| u.v_s.mmsi() == Some(mmsi) && u.v_s.sequence() == Some(sequence))
            .filter_map(|u| u.v_s.block().map(|b| (b, u)))
            .filter(|(b, _)| *b != segment)
            .collect();
        same_track.sort_by_key(|(b, _)| *b);

        let adjacent: Vec<KnowledgeUnit> = same_track
            .iter()
            .filter(|(b, _)| b.abs_diff(segment) == 1)
            .map(|(_, u)| (*u).clone())
            .collect();
        if !adjacent.is_empty() {
            return adjacent;
        }

        same_track.sort_by_key(|(b, _)| (b.abs_diff(segment), *b));
        same_track
            .into_iter()
            .take(2)
            .map(|(_, u)| u.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Imputation results
// ---------------------------------------------------------------------------

/// Behaviour chosen by the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSelection {
    pub selected_movement_id: Option<BehaviorId>,
    #[serde(default)]
    pub graph_support: String,
    #[serde(default)]
    pub contextual_justification: String,
}

/// Function chosen by the method selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSelection {
    pub selected_function_id: Option<FunctionId>,
    #[serde(default)]
    pub statistical_support: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub imputation_action: String,
}

/// Explanation composed for the imputation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    #[serde(default)]
    pub regulatory_rule_cue: String,
    #[serde(default)]
    pub operational_protocol_rationale: String,
}

/// One imputed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputedPoint {
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Ledger entry of the imputation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputationResult {
    pub sequence_id: u64,
    pub segment_id: usize,
    /// `None` when the vessel could not be determined; written as `"unknown"`.
    #[serde(default, with = "mmsi_or_unknown")]
    pub mmsi: Option<u64>,
    pub behavior_estimator: Option<BehaviorSelection>,
    pub method_selector: Option<MethodSelection>,
    pub explanation_composer: Option<Explanation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imputed_points: Vec<ImputedPoint>,
    /// Set by a collaborator that finished but could not produce a result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImputationResult {
    /// A result with all three stages empty.
    pub fn empty(sequence_id: u64, segment_id: usize, mmsi: Option<u64>) -> Self {
        Self {
            sequence_id,
            segment_id,
            mmsi,
            behavior_estimator: None,
            method_selector: None,
            explanation_composer: None,
            imputed_points: Vec::new(),
            error: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.behavior_estimator.is_none()
            && self.method_selector.is_none()
            && self.explanation_composer.is_none()
    }
}

/// A vessel id as a JSON number, or the string `"unknown"` when absent.
mod mmsi_or_unknown {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const UNKNOWN: &str = "unknown";

    pub fn serialize<S: Serializer>(mmsi: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match mmsi {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_str(UNKNOWN),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Number(value)) => Some(value),
            Some(Raw::Text(text)) => text.trim().parse().ok(),
            None => None,
        })
    }
}
