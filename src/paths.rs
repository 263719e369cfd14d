//! Results directory layout for one experiment.
//!
//! ```text
//! <results_root>/<exp_name>/
//!   graph/              knowledge-store checkpoints
//!   knowledge_units/    knowledge-unit ledger checkpoints
//!   imputation/         imputation-result ledger checkpoints
//!   logs/               run logs
//! ```

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ExperimentConfig;

/// Errors from path resolution.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    #[error("failed to create directory: {path}")]
    #[diagnostic(
        code(vista::paths::create_dir),
        help("Check that the parent directory exists and you have write permissions.")
    )]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type PathResult<T> = std::result::Result<T, PathError>;

/// Per-experiment directory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentPaths {
    /// `<results_root>/<exp_name>/`
    pub root: PathBuf,
    /// `root/graph/`
    pub graph_dir: PathBuf,
    /// `root/knowledge_units/`
    pub knowledge_dir: PathBuf,
    /// `root/imputation/`
    pub imputation_dir: PathBuf,
    /// `root/logs/`
    pub logs_dir: PathBuf,
}

impl ExperimentPaths {
    /// Derive the layout from a config. Does not touch the filesystem.
    pub fn for_config(config: &ExperimentConfig) -> Self {
        let root = config.results_root.join(&config.exp_name);
        Self {
            graph_dir: root.join("graph"),
            knowledge_dir: root.join("knowledge_units"),
            imputation_dir: root.join("imputation"),
            logs_dir: root.join("logs"),
            root,
        }
    }

    /// Create all experiment directories. Idempotent.
    pub fn ensure_dirs(&self) -> PathResult<()> {
        for dir in [
            &self.root,
            &self.graph_dir,
            &self.knowledge_dir,
            &self.imputation_dir,
            &self.logs_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| PathError::CreateDir {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Path of the config file kept next to the results.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("vista.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_config() {
        let config = ExperimentConfig {
            results_root: PathBuf::from("/data/results"),
            ..ExperimentConfig::with_name("dk-march")
        };
        let paths = ExperimentPaths::for_config(&config);
        assert_eq!(paths.root, PathBuf::from("/data/results/dk-march"));
        assert_eq!(paths.graph_dir, PathBuf::from("/data/results/dk-march/graph"));
        assert_eq!(
            paths.imputation_dir,
            PathBuf::from("/data/results/dk-march/imputation")
        );
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/data/results/dk-march/vista.toml")
        );
    }

    #[test]
    fn ensure_dirs_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ExperimentConfig {
            results_root: dir.path().to_path_buf(),
            ..ExperimentConfig::with_name("idem")
        };
        let paths = ExperimentPaths::for_config(&config);
        paths.ensure_dirs().unwrap();
        paths.ensure_dirs().unwrap();
        assert!(paths.knowledge_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
    }
}
