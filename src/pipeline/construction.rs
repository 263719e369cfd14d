//! Graph-construction pipeline.
//!
//! Three stacks feed each other: `pending` tasks are extracted in batches,
//! accepted units wait in `extracted`, and up to `batch_size` deduplication
//! batches run on a second pool while extraction continues. Finished merge
//! batches are committed to the store under one write lock. Before a
//! checkpoint the stages are flushed, so saved graph and ledger agree.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use crate::classify::{TaskFailure, Verdict, classify};
use crate::collab::{CollabContext, Deduplicator, Extraction, Extractor, UsageMetrics};
use crate::error::{PipelineError, PipelineResult};
use crate::graph::KnowledgeUnit;
use crate::graph::store::KnowledgeStore;
use crate::ledger::KnowledgeLedger;
use crate::redundancy::deduplicate_batch;
use crate::task::{Task, TaskKind};

use super::{PipelineReport, SchedulerSettings, WorkerPool, pop_batch};

/// Extract → deduplicate → commit.
pub struct ConstructionPipeline {
    settings: SchedulerSettings,
    store: Arc<KnowledgeStore>,
    metrics: Arc<UsageMetrics>,
    extractor: Arc<dyn Extractor>,
    deduplicator: Arc<dyn Deduplicator>,
    graph_dir: PathBuf,
}

impl ConstructionPipeline {
    pub fn new(
        settings: SchedulerSettings,
        store: Arc<KnowledgeStore>,
        metrics: Arc<UsageMetrics>,
        extractor: Arc<dyn Extractor>,
        deduplicator: Arc<dyn Deduplicator>,
        graph_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            store,
            metrics,
            extractor,
            deduplicator,
            graph_dir: graph_dir.into(),
        }
    }

    /// Process `tasks` (a stack: the last task runs first), appending to
    /// `ledger` and committing to the store.
    pub fn run(&self, tasks: Vec<Task>, ledger: &mut KnowledgeLedger) -> PipelineResult<PipelineReport> {
        self.settings.validate()?;
        let extract_pool = WorkerPool::new("extract", self.settings.workers, self.settings.task_timeout)?;
        let merge_pool = WorkerPool::new("merge", self.settings.workers, self.settings.task_timeout)?;
        let mut merging = MergeStage::new(&merge_pool, self.settings.batch_size);

        let mut pending = tasks;
        let mut extracted: Vec<Extraction> = Vec::new();
        let mut cadence = self.settings.cadence();
        let mut report = PipelineReport::default();
        let ctx = CollabContext {
            store: &self.store,
            metrics: &self.metrics,
            top_k: self.settings.top_k,
        };

        tracing::info!(tasks = pending.len(), "graph construction started");

        while !pending.is_empty() || !extracted.is_empty() || !merging.is_idle() {
            let mut progressed = false;

            if !pending.is_empty() {
                let batch = pop_batch(&mut pending, self.settings.batch_size);
                report.dispatched += batch.iter().filter(|t| t.is_dispatched()).count();
                report.short_circuited += batch.iter().filter(|t| !t.is_dispatched()).count();

                let results = extract_pool.run_batch(batch, |task| self.extract(&ctx, task));
                for (mut task, outcome) in results {
                    let (unit, flags) = match outcome {
                        Ok(e) => (Ok(e.unit), Some((e.new_values, e.new_function))),
                        Err(failure) => (Err(failure), None),
                    };
                    let verdict = classify(&mut task, unit, ledger, self.settings.max_retries, None);
                    report.count(verdict);
                    match verdict {
                        Verdict::Accepted => {
                            if let (Some(unit), Some((new_values, new_function))) =
                                (ledger.last().cloned(), flags)
                            {
                                extracted.push(Extraction {
                                    unit,
                                    new_values,
                                    new_function,
                                });
                            }
                        }
                        Verdict::Retry => pending.push(task),
                        Verdict::GaveUp => {}
                    }
                }
                progressed = true;
            }

            while merging.has_capacity() && !extracted.is_empty() {
                let batch = pop_batch(&mut extracted, self.settings.batch_size);
                merging.submit(batch, self.merge_job());
                progressed = true;
            }

            for units in merging.poll() {
                self.commit(&units, &mut report);
                progressed = true;
            }

            if let Some(tag) = cadence.due(ledger.len()) {
                self.flush(&mut merging, &mut extracted, &mut report);
                self.checkpoint(tag, ledger)?;
                cadence.mark(tag);
                report.checkpoints.push(tag);
            }

            if !progressed {
                std::thread::sleep(self.settings.idle_backoff);
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
            merged_batches = report.merged_batches,
            ledger = ledger.len(),
            "graph construction finished"
        );
        self.metrics.log_summary();
        Ok(report)
    }

    fn extract(&self, ctx: &CollabContext<'_>, task: &Task) -> Result<Extraction, TaskFailure> {
        match task.kind {
            TaskKind::Empty | TaskKind::Skip => Ok(Extraction {
                unit: KnowledgeUnit::placeholder(),
                ..Default::default()
            }),
            TaskKind::Process { .. } => Ok(self.extractor.extract(ctx, task)?),
        }
    }

    fn merge_job(&self) -> impl FnOnce(Vec<Extraction>) -> Vec<KnowledgeUnit> + Send + 'static {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let deduplicator = Arc::clone(&self.deduplicator);
        let top_k = self.settings.top_k;
        move |batch| {
            let ctx = CollabContext {
                store: &store,
                metrics: &metrics,
                top_k,
            };
            deduplicate_batch(&ctx, deduplicator.as_ref(), batch)
        }
    }

    /// Send every accepted unit through deduplication and commit it, so a
    /// checkpoint's graph reflects every ledger entry it is saved with.
    fn flush(&self, merging: &mut MergeStage<'_>, extracted: &mut Vec<Extraction>, report: &mut PipelineReport) {
        while !extracted.is_empty() {
            let batch = pop_batch(extracted, self.settings.batch_size);
            merging.submit(batch, self.merge_job());
        }
        for units in merging.drain() {
            self.commit(&units, report);
        }
    }

    fn commit(&self, units: &[KnowledgeUnit], report: &mut PipelineReport) {
        let applied = self.store.update_graph_batch(units);
        report.merged_batches += 1;
        tracing::debug!(units = units.len(), applied, "merge batch committed");
    }

    fn checkpoint(&self, tag: u64, ledger: &KnowledgeLedger) -> PipelineResult<()> {
        self.store
            .save_alongside(&self.graph_dir, tag, || ledger.save(tag))
            .map_err(|source| PipelineError::Checkpoint { tag, source })?;
        tracing::info!(tag, units = ledger.len(), "graph checkpoint written");
        Ok(())
    }
}

/// In-flight deduplication batches on the merge pool.
///
/// Dropping the stage waits for every submitted batch, so no merge job
/// outlives the pipeline run even on an early return.
struct MergeStage<'p> {
    pool: &'p WorkerPool,
    tx: Sender<Vec<KnowledgeUnit>>,
    rx: Receiver<Vec<KnowledgeUnit>>,
    in_flight: usize,
    capacity: usize,
}

impl<'p> MergeStage<'p> {
    fn new(pool: &'p WorkerPool, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            pool,
            tx,
            rx,
            in_flight: 0,
            capacity: capacity.max(1),
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0
    }

    fn has_capacity(&self) -> bool {
        self.in_flight < self.capacity
    }

    fn submit<F>(&mut self, batch: Vec<Extraction>, job: F)
    where
        F: FnOnce(Vec<Extraction>) -> Vec<KnowledgeUnit> + Send + 'static,
    {
        let tx = self.tx.clone();
        let fallback: Vec<KnowledgeUnit> = batch.iter().map(|e| e.unit.clone()).collect();
        self.in_flight += 1;
        self.pool.spawn(move || {
            let units = catch_unwind(AssertUnwindSafe(|| job(batch))).unwrap_or_else(|_| {
                tracing::error!(units = fallback.len(), "deduplication panicked, committing batch as extracted");
                fallback
            });
            // The receiver only disappears after every batch has been received.
            let _ = tx.send(units);
        });
    }

    /// Finished batches, without blocking.
    fn poll(&mut self) -> Vec<Vec<KnowledgeUnit>> {
        let mut done = Vec::new();
        while self.in_flight > 0 {
            match self.rx.try_recv() {
                Ok(units) => {
                    self.in_flight -= 1;
                    done.push(units);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.in_flight = 0;
                    break;
                }
            }
        }
        done
    }

    /// Block until every in-flight batch has finished.
    fn drain(&mut self) -> Vec<Vec<KnowledgeUnit>> {
        let mut done = Vec::new();
        while self.in_flight > 0 {
            match self.rx.recv() {
                Ok(units) => {
                    self.in_flight -= 1;
                    done.push(units);
                }
                Err(_) => self.in_flight = 0,
            }
        }
        done
    }
}

impl Drop for MergeStage<'_> {
    fn drop(&mut self) {
        if !self.is_idle() {
            let abandoned = self.drain();
            tracing::warn!(batches = abandoned.len(), "merge batches discarded on early exit");
        }
    }
}
