//! Experiment configuration, persisted as TOML.
//!
//! Every field has a default so a partial config file (or none at all) is valid.
//! The same struct feeds the scheduler settings, ledger file names and the
//! results directory layout.

use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(vista::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(vista::config::parse),
        help("Check the TOML syntax in the config file. Unknown keys are rejected.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(vista::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config value for `{field}`: {message}")]
    #[diagnostic(
        code(vista::config::invalid),
        help("Fix the value in the config file or on the command line and re-run.")
    )]
    Invalid { field: &'static str, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration of one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Experiment name; results go to `<results_root>/<exp_name>/`.
    #[serde(default = "default_exp_name")]
    pub exp_name: String,
    /// Root directory for all experiment output.
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,
    /// Random seed of the data split (recorded in ledger file names).
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of trajectories in the dataset (recorded in ledger file names).
    #[serde(default = "default_trajectory_num")]
    pub trajectory_num: usize,
    /// Points per trajectory.
    #[serde(default = "default_trajectory_len")]
    pub trajectory_len: usize,
    /// Points per segment.
    #[serde(default = "default_mini_segment_len")]
    pub mini_segment_len: usize,
    /// First trajectory index to process; also the tag resumed from.
    #[serde(default)]
    pub check_point: u64,
    /// One past the last trajectory index to process.
    #[serde(default = "default_end_point")]
    pub end_point: u64,
    /// Tag of an already-built graph to reuse before constructing a new one.
    #[serde(default = "default_end_point_graph")]
    pub end_point_graph: u64,
    /// Checkpoint stride, in trajectories.
    #[serde(default = "default_process_length")]
    pub process_length: u64,
    /// Number of behaviour/function candidates to retrieve.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Worker-pool size, also used as batch size.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Retry ceiling per task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Workers slower than this are classified as timed out.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

fn default_exp_name() -> String {
    "default".into()
}
fn default_results_root() -> PathBuf {
    PathBuf::from("results")
}
fn default_seed() -> u64 {
    40
}
fn default_trajectory_num() -> usize {
    1000
}
fn default_trajectory_len() -> usize {
    200
}
fn default_mini_segment_len() -> usize {
    20
}
fn default_end_point() -> u64 {
    1
}
fn default_end_point_graph() -> u64 {
    2
}
fn default_process_length() -> u64 {
    2
}
fn default_top_k() -> usize {
    5
}
fn default_max_concurrent() -> usize {
    9
}
fn default_max_retries() -> u32 {
    3
}
fn default_task_timeout_secs() -> u64 {
    120
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            exp_name: default_exp_name(),
            results_root: default_results_root(),
            seed: default_seed(),
            trajectory_num: default_trajectory_num(),
            trajectory_len: default_trajectory_len(),
            mini_segment_len: default_mini_segment_len(),
            check_point: 0,
            end_point: default_end_point(),
            end_point_graph: default_end_point_graph(),
            process_length: default_process_length(),
            top_k: default_top_k(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

impl ExperimentConfig {
    /// Create a config with a specific experiment name (other fields default).
    pub fn with_name(name: &str) -> Self {
        Self {
            exp_name: name.to_string(),
            ..Default::default()
        }
    }

    /// Number of segments each trajectory is split into.
    pub fn segments_per_trajectory(&self) -> usize {
        self.trajectory_len / self.mini_segment_len.max(1)
    }

    /// Prefix shared by every ledger file of this experiment.
    pub fn ledger_stem(&self) -> String {
        format!(
            "trajectory{}_len{}_seed{}",
            self.trajectory_num, self.trajectory_len, self.seed
        )
    }

    /// Reject values the schedulers cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.mini_segment_len == 0 {
            return Err(invalid("mini_segment_len", "must be > 0"));
        }
        if self.trajectory_len < self.mini_segment_len {
            return Err(invalid(
                "trajectory_len",
                format!(
                    "{} is shorter than one segment ({})",
                    self.trajectory_len, self.mini_segment_len
                ),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent", "must be > 0"));
        }
        if self.top_k == 0 {
            return Err(invalid("top_k", "must be > 0"));
        }
        if self.end_point < self.check_point {
            return Err(invalid(
                "end_point",
                format!(
                    "{} is before check_point {}",
                    self.end_point, self.check_point
                ),
            ));
        }
        Ok(())
    }

    /// Load from a TOML file.
    pub fn load(path: &std::path::Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &std::path::Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}
