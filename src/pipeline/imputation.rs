//! Imputation pipeline: one stage, store read-only.

use crate::classify::{TaskFailure, Verdict, classify};
use crate::collab::{CollabContext, CollabResult, ImputationCollaborator, ImputationRequest, UsageMetrics};
use crate::error::{PipelineError, PipelineResult};
use crate::graph::BehaviorId;
use crate::graph::store::KnowledgeStore;
use crate::ledger::{ImputationLedger, ImputationResult, KnowledgeLedger};
use crate::task::Task;

use super::{PipelineReport, SchedulerSettings, WorkerPool, pop_batch};

/// Estimate → select → explain over missing segments.
pub struct ImputationPipeline<'a> {
    settings: SchedulerSettings,
    store: &'a KnowledgeStore,
    knowledge: &'a KnowledgeLedger,
    collaborator: &'a dyn ImputationCollaborator,
    metrics: &'a UsageMetrics,
}

impl<'a> ImputationPipeline<'a> {
    pub fn new(
        settings: SchedulerSettings,
        store: &'a KnowledgeStore,
        knowledge: &'a KnowledgeLedger,
        collaborator: &'a dyn ImputationCollaborator,
        metrics: &'a UsageMetrics,
    ) -> Self {
        Self {
            settings,
            store,
            knowledge,
            collaborator,
            metrics,
        }
    }

    pub fn run(&self, tasks: Vec<Task>, ledger: &mut ImputationLedger) -> PipelineResult<PipelineReport> {
        self.settings.validate()?;
        let pool = WorkerPool::new("impute", self.settings.workers, self.settings.task_timeout)?;
        let mut pending = tasks;
        let mut cadence = self.settings.cadence();
        let mut report = PipelineReport::default();
        let ctx = CollabContext {
            store: self.store,
            metrics: self.metrics,
            top_k: self.settings.top_k,
        };

        tracing::info!(tasks = pending.len(), "imputation started");

        while !pending.is_empty() {
            let batch = pop_batch(&mut pending, self.settings.batch_size);
            let (dispatch, skipped): (Vec<Task>, Vec<Task>) =
                batch.into_iter().partition(Task::is_dispatched);

            for mut task in skipped {
                let empty = ImputationResult::empty(task.sequence_id, task.segment_id, task.mmsi);
                let verdict = classify(&mut task, Ok(empty), ledger, self.settings.max_retries, None);
                report.short_circuited += 1;
                report.count(verdict);
            }

            report.dispatched += dispatch.len();
            let results = pool.run_batch(dispatch, |task| {
                self.impute(&ctx, task).map_err(TaskFailure::from)
            });
            for (mut task, outcome) in results {
                let verdict = classify(
                    &mut task,
                    outcome,
                    ledger,
                    self.settings.max_retries,
                    Some(self.store),
                );
                report.count(verdict);
                if verdict == Verdict::Retry {
                    pending.push(task);
                }
            }

            if let Some(tag) = cadence.due(ledger.len()) {
                self.checkpoint(tag, ledger)?;
                cadence.mark(tag);
                report.checkpoints.push(tag);
            }
        }

        if let Some(tag) = cadence.unsaved(ledger.len()) {
            self.checkpoint(tag, ledger)?;
            cadence.mark(tag);
            report.checkpoints.push(tag);
        }

        tracing::info!(
            dispatched = report.dispatched,
            accepted = report.accepted,
            retried = report.retried,
            gave_up = report.gave_up,
            results = ledger.len(),
            "imputation finished"
        );
        self.metrics.log_summary();
        Ok(report)
    }

    fn impute(&self, ctx: &CollabContext<'_>, task: &Task) -> CollabResult<ImputationResult> {
        let neighbors = task
            .mmsi
            .map(|mmsi| {
                self.knowledge
                    .neighbor_context(mmsi, task.sequence_id, task.segment_id)
            })
            .unwrap_or_default();
        let statics: Vec<_> = neighbors.iter().map(|u| &u.v_s).collect();
        let behavior_candidates = self.store.select_behavior_candidates(&statics, ctx.top_k);

        let request = ImputationRequest {
            sequence_id: task.sequence_id,
            segment_id: task.segment_id,
            mmsi: task.mmsi,
            rows: task.rows().to_vec(),
            neighbors: neighbors.clone(),
            behavior_candidates,
        };

        let behavior = self.collaborator.estimate(ctx, &request)?;
        let behavior_ids: Vec<BehaviorId> = match behavior.selected_movement_id {
            Some(id) => vec![id],
            None => request.behavior_candidates.iter().map(|c| c.id).collect(),
        };
        let functions = self.store.select_function_candidates(&behavior_ids, ctx.top_k);

        let method = self
            .collaborator
            .select(ctx, &request, &behavior, &functions)?;
        let function_ids: Vec<_> = match method.selected_function_id {
            Some(id) => vec![id],
            None => functions.iter().map(|c| c.id).collect(),
        };
        let subgraph = self
            .store
            .render_induced_subgraph(&statics, &behavior_ids, &function_ids);

        let explanation = self
            .collaborator
            .explain(ctx, &request, &behavior, &method, &subgraph)?;
        let imputed_points = self.collaborator.apply(&request, &method)?;

        Ok(ImputationResult {
            sequence_id: task.sequence_id,
            segment_id: task.segment_id,
            mmsi: task.mmsi,
            behavior_estimator: Some(behavior),
            method_selector: Some(method),
            explanation_composer: Some(explanation),
            imputed_points,
            error: None,
        })
    }

    fn checkpoint(&self, tag: u64, ledger: &ImputationLedger) -> PipelineResult<()> {
        ledger
            .save(tag)
            .map_err(|source| PipelineError::Checkpoint { tag, source })
    }
}
