//! Failure classifier: turns a finished task into accept, retry or give-up.
//!
//! | outcome                                   | below ceiling | at ceiling        |
//! |-------------------------------------------|---------------|-------------------|
//! | worker failed, panicked or timed out      | retry         | placeholder       |
//! | record carries an error                   | retry         | placeholder       |
//! | record names a function the store lacks   | retry         | placeholder       |
//! | anything else                             | accept        | accept            |
//!
//! Exactly one ledger entry is appended per task: the accepted record or,
//! once the ceiling is reached, a placeholder.

use std::time::Duration;

use miette::Diagnostic;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::collab::CollaboratorError;
use crate::graph::store::KnowledgeStore;
use crate::graph::{FunctionId, KnowledgeUnit};
use crate::ledger::{ImputationResult, Ledger};
use crate::task::Task;

/// Why a worker produced no record.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum TaskFailure {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("worker panicked: {message}")]
    #[diagnostic(code(vista::task::panicked))]
    Panicked { message: String },

    #[error("worker exceeded its time budget ({elapsed:?} > {limit:?})")]
    #[diagnostic(code(vista::task::timed_out))]
    TimedOut { elapsed: Duration, limit: Duration },
}

/// A record that can be appended to a ledger and validated by the classifier.
pub trait LedgerRecord: Serialize + DeserializeOwned + Clone + Send {
    /// Entry recorded when a task gives up.
    fn placeholder(task: &Task) -> Self;

    /// Error reported inside an otherwise completed record.
    fn carried_error(&self) -> Option<&str> {
        None
    }

    /// Function id the record depends on being in the store.
    fn referenced_function(&self) -> Option<FunctionId> {
        None
    }
}

impl LedgerRecord for KnowledgeUnit {
    fn placeholder(_task: &Task) -> Self {
        KnowledgeUnit::placeholder()
    }
}

impl LedgerRecord for ImputationResult {
    fn placeholder(task: &Task) -> Self {
        ImputationResult::empty(task.sequence_id, task.segment_id, task.mmsi)
    }

    fn carried_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn referenced_function(&self) -> Option<FunctionId> {
        self.method_selector
            .as_ref()
            .and_then(|m| m.selected_function_id)
    }
}

/// Classifier decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Record appended; `retry_count` reset.
    Accepted,
    /// `retry_count` incremented; requeue the task.
    Retry,
    /// Placeholder appended; the task is finished.
    GaveUp,
}

/// Classify one finished task against `ledger`.
///
/// `store` enables the referential check and is only passed by the
/// imputation pipeline.
pub fn classify<T: LedgerRecord>(
    task: &mut Task,
    outcome: Result<T, TaskFailure>,
    ledger: &mut Ledger<T>,
    ceiling: u32,
    store: Option<&KnowledgeStore>,
) -> Verdict {
    let reason = match outcome {
        Err(failure) => failure.to_string(),
        Ok(record) => match rejection(&record, store) {
            None => {
                task.retry_count = 0;
                ledger.push(record);
                return Verdict::Accepted;
            }
            Some(reason) => reason,
        },
    };

    if task.retry_count < ceiling {
        task.retry_count += 1;
        tracing::warn!(
            sequence_id = task.sequence_id,
            segment_id = task.segment_id,
            attempt = task.retry_count,
            ceiling,
            %reason,
            "task failed, retrying"
        );
        Verdict::Retry
    } else {
        tracing::error!(
            sequence_id = task.sequence_id,
            segment_id = task.segment_id,
            ceiling,
            %reason,
            "task gave up, recording placeholder"
        );
        ledger.push(T::placeholder(task));
        Verdict::GaveUp
    }
}

fn rejection<T: LedgerRecord>(record: &T, store: Option<&KnowledgeStore>) -> Option<String> {
    if let Some(error) = record.carried_error() {
        return Some(format!("record carries error: {error}"));
    }
    let store = store?;
    let id = record.referenced_function()?;
    (!store.function_exists(id)).then(|| format!("function {id} not in store"))
}
