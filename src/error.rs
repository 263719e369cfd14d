//! Rich diagnostic error types for vista-kg.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so users know exactly what
//! went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::paths::PathError;

/// Top-level error type for vista-kg.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum VistaError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),
}

/// Convenience alias used by the experiment facade and the CLI.
pub type VistaResult<T> = std::result::Result<T, VistaError>;

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(vista::store::io),
        help(
            "A checkpoint file could not be read or written. Check that the results \
             directory exists, has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error in {path}: {message}")]
    #[diagnostic(
        code(vista::store::serde),
        help(
            "A checkpoint document is not valid JSON for the expected structure. \
             It was probably written by an incompatible version; rebuild from an \
             earlier checkpoint tag or start from tag 0."
        )
    )]
    Serialization { path: String, message: String },
}

/// Result type for persistence operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("malformed {kind} id: \"{raw}\"")]
    #[diagnostic(
        code(vista::graph::malformed_id),
        help(
            "Behaviour ids look like `vb_` followed by 16 hex digits and function ids \
             like `vf_` followed by 16 hex digits. Copy the id from `vista info` output."
        )
    )]
    MalformedId { kind: &'static str, raw: String },

    #[error("behaviour node not found: {id}")]
    #[diagnostic(
        code(vista::graph::behavior_not_found),
        help("The behaviour id is not present in the loaded graph. Check the checkpoint tag.")
    )]
    BehaviorNotFound { id: String },

    #[error("function node not found: {id}")]
    #[diagnostic(
        code(vista::graph::function_not_found),
        help(
            "The function id is not present in the loaded graph. It may have been merged \
             into another function node; re-query candidates to get the surviving id."
        )
    )]
    FunctionNotFound { id: String },
}

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

// ---------------------------------------------------------------------------
// Pipeline errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("missing mask has no entry for sequence #{seq_idx} segment {segment_id} (mask is {rows}x{cols})")]
    #[diagnostic(
        code(vista::pipeline::mask_out_of_range),
        help(
            "The missing mask must have one row per processed sequence and one column per \
             segment. Check that check_point/end_point select the same window as the mask."
        )
    )]
    MaskOutOfRange {
        seq_idx: usize,
        segment_id: usize,
        rows: usize,
        cols: usize,
    },

    #[error("invalid scheduler settings: {message}")]
    #[diagnostic(
        code(vista::pipeline::invalid_settings),
        help("Batch size, worker count and segments per trajectory must all be non-zero.")
    )]
    InvalidSettings { message: String },

    #[error("failed to build worker pool: {message}")]
    #[diagnostic(
        code(vista::pipeline::worker_pool),
        help("The operating system refused to spawn worker threads. Lower max_concurrent.")
    )]
    WorkerPool { message: String },

    #[error("checkpoint at trajectory {tag} failed")]
    #[diagnostic(
        code(vista::pipeline::checkpoint),
        help("Progress since the previous checkpoint is kept in memory but was not persisted.")
    )]
    Checkpoint {
        tag: u64,
        #[source]
        source: StoreError,
    },
}

/// Result type for scheduler operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_into_top_level() {
        let err: VistaError = StoreError::Serialization {
            path: "x.json".into(),
            message: "eof".into(),
        }
        .into();
        assert!(matches!(err, VistaError::Store(_)));
        assert!(err.to_string().contains("x.json"));
    }

    #[test]
    fn diagnostic_codes_are_namespaced() {
        let err = GraphError::MalformedId {
            kind: "function",
            raw: "nope".into(),
        };
        let code = err.code().map(|c| c.to_string()).unwrap_or_default();
        assert_eq!(code, "vista::graph::malformed_id");
    }
}
