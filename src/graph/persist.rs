//! Checkpoint files for the knowledge store.
//!
//! One JSON document per structure per tag:
//!
//! ```text
//! pattern_attributes_dicts_<tag>.json
//! static_edges_<tag>.json
//! behavior_edges_<tag>.json
//! behavior_nodes_<tag>.json
//! function_edges_<tag>.json
//! function_nodes_<tag>.json
//! ```
//!
//! Documents are written to a temporary sibling and renamed into place, so a
//! crash mid-save never leaves a truncated checkpoint.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};

use super::store::GraphState;

pub const DICTIONARIES: &str = "pattern_attributes_dicts";
pub const STATIC_EDGES: &str = "static_edges";
pub const BEHAVIOR_EDGES: &str = "behavior_edges";
pub const BEHAVIOR_NODES: &str = "behavior_nodes";
pub const FUNCTION_EDGES: &str = "function_edges";
pub const FUNCTION_NODES: &str = "function_nodes";

/// What a load found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<&'static str>,
    pub missing: Vec<&'static str>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Path of one checkpoint document.
pub fn checkpoint_path(dir: &Path, stem: &str, tag: u64) -> PathBuf {
    dir.join(format!("{stem}_{tag}.json"))
}

/// Serialize `value` to `path` via a temporary sibling and rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let io_err = |p: &Path, source| StoreError::Io {
        path: p.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

/// Read a JSON document; `Ok(None)` when the file does not exist.
pub fn read_json_optional<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::Io {
                path: path.display().to_string(),
                source: e,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Serialization {
            path: path.display().to_string(),
            message: e.to_string(),
        })
}

pub(crate) fn save_state(dir: &Path, tag: u64, state: &GraphState) -> StoreResult<()> {
    write_json_atomic(&checkpoint_path(dir, DICTIONARIES, tag), &state.dictionaries)?;
    write_json_atomic(&checkpoint_path(dir, STATIC_EDGES, tag), &state.static_edges)?;
    write_json_atomic(&checkpoint_path(dir, BEHAVIOR_EDGES, tag), &state.behavior_edges)?;
    write_json_atomic(&checkpoint_path(dir, BEHAVIOR_NODES, tag), &state.behavior_nodes)?;
    write_json_atomic(&checkpoint_path(dir, FUNCTION_EDGES, tag), &state.function_edges)?;
    write_json_atomic(&checkpoint_path(dir, FUNCTION_NODES, tag), &state.function_nodes)?;
    tracing::info!(tag, dir = %dir.display(), "knowledge store saved");
    Ok(())
}

/// Overwrite each structure of `state` whose document exists; keep the rest.
pub(crate) fn load_into(dir: &Path, tag: u64, state: &mut GraphState) -> StoreResult<LoadReport> {
    let mut report = LoadReport::default();

    fn slot<T: DeserializeOwned>(
        dir: &Path,
        stem: &'static str,
        tag: u64,
        target: &mut T,
        report: &mut LoadReport,
    ) -> StoreResult<()> {
        let path = checkpoint_path(dir, stem, tag);
        match read_json_optional(&path)? {
            Some(value) => {
                *target = value;
                report.loaded.push(stem);
            }
            None => {
                tracing::warn!(path = %path.display(), "checkpoint file missing, keeping current state");
                report.missing.push(stem);
            }
        }
        Ok(())
    }

    slot(dir, DICTIONARIES, tag, &mut state.dictionaries, &mut report)?;
    slot(dir, STATIC_EDGES, tag, &mut state.static_edges, &mut report)?;
    slot(dir, BEHAVIOR_EDGES, tag, &mut state.behavior_edges, &mut report)?;
    slot(dir, BEHAVIOR_NODES, tag, &mut state.behavior_nodes, &mut report)?;
    slot(dir, FUNCTION_EDGES, tag, &mut state.function_edges, &mut report)?;
    slot(dir, FUNCTION_NODES, tag, &mut state.function_nodes, &mut report)?;

    tracing::info!(
        tag,
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        "knowledge store loaded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = checkpoint_path(dir.path(), "sample", 4);
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let back: Option<Vec<u32>> = read_json_optional(&path).unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[test]
    fn missing_document_reads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let back: Option<Vec<u32>> =
            read_json_optional(&checkpoint_path(dir.path(), "absent", 0)).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn corrupt_document_is_a_serialization_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = checkpoint_path(dir.path(), "broken", 1);
        std::fs::write(&path, b"{not json").unwrap();
        let result: StoreResult<Option<Vec<u32>>> = read_json_optional(&path);
        assert!(matches!(result, Err(StoreError::Serialization { .. })));
    }

    #[test]
    fn load_into_empty_dir_keeps_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut state = GraphState::default();
        state.dictionaries.intent.insert("fishing".into());
        let report = load_into(dir.path(), 3, &mut state).unwrap();
        assert_eq!(report.missing.len(), 6);
        assert!(!report.is_complete());
        assert!(state.dictionaries.intent.contains("fishing"));
    }
}
