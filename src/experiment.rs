//! Experiment facade: top-level API tying config, store, ledgers and
//! pipelines together.
//!
//! An `Experiment` owns everything one run touches. The mask passed to the
//! pipeline methods has one row per sequence of the table, in table order;
//! the `[check_point, end_point)` window of both is what gets processed.
//! A run with `check_point > 0` first reloads the state saved at that tag.

use std::sync::Arc;

use crate::collab::{Deduplicator, Extractor, ImputationCollaborator, UsageMetrics};
use crate::config::ExperimentConfig;
use crate::error::VistaResult;
use crate::graph::persist::LoadReport;
use crate::graph::store::{KnowledgeStore, StoreStats};
use crate::ledger::{IMPUTATION_PREFIX, ImputationLedger, KNOWLEDGE_PREFIX, KnowledgeLedger};
use crate::paths::ExperimentPaths;
use crate::pipeline::construction::ConstructionPipeline;
use crate::pipeline::imputation::ImputationPipeline;
use crate::pipeline::{PipelineReport, SchedulerSettings};
use crate::task::{BuildMode, Task, build_segment_tasks};
use crate::trajectory::{MissingMask, TrajectoryTable};

/// What a checkpoint load found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub tag: u64,
    pub graph: LoadReport,
    pub knowledge_units: Option<usize>,
    pub imputation_results: Option<usize>,
}

/// Which stages [`Experiment::run`] executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub construction: Option<PipelineReport>,
    pub imputation: Option<PipelineReport>,
}

/// Snapshot for `vista info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentInfo {
    pub exp_name: String,
    pub store: StoreStats,
    pub knowledge_units: usize,
    pub imputation_results: usize,
}

impl std::fmt::Display for ExperimentInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "experiment:         {}", self.exp_name)?;
        writeln!(f, "static nodes:       {}", self.store.static_nodes)?;
        writeln!(f, "behaviour nodes:    {}", self.store.behavior_nodes)?;
        writeln!(f, "function nodes:     {}", self.store.function_nodes)?;
        writeln!(f, "static edges:       {}", self.store.static_edges)?;
        writeln!(f, "function edges:     {}", self.store.function_edges)?;
        writeln!(f, "dictionary terms:   {}", self.store.dictionary_terms)?;
        writeln!(f, "knowledge units:    {}", self.knowledge_units)?;
        write!(f, "imputation results: {}", self.imputation_results)
    }
}

/// One experiment run.
pub struct Experiment {
    config: ExperimentConfig,
    paths: ExperimentPaths,
    store: Arc<KnowledgeStore>,
    knowledge: KnowledgeLedger,
    results: ImputationLedger,
    metrics: Arc<UsageMetrics>,
}

impl Experiment {
    /// Validate the config and create the results directories.
    pub fn new(config: ExperimentConfig) -> VistaResult<Self> {
        config.validate()?;
        let paths = ExperimentPaths::for_config(&config);
        paths.ensure_dirs()?;
        let stem = config.ledger_stem();
        let knowledge = KnowledgeLedger::new(&paths.knowledge_dir, format!("{KNOWLEDGE_PREFIX}_{stem}"));
        let results = ImputationLedger::new(&paths.imputation_dir, format!("{IMPUTATION_PREFIX}_{stem}"));
        tracing::info!(exp = %config.exp_name, root = %paths.root.display(), "experiment opened");
        Ok(Self {
            config,
            paths,
            store: Arc::new(KnowledgeStore::new()),
            knowledge,
            results,
            metrics: Arc::new(UsageMetrics::new()),
        })
    }

    /// Load store and both ledgers at `tag`; missing files are tolerated.
    pub fn load(&mut self, tag: u64) -> VistaResult<LoadSummary> {
        let graph = self.store.load(&self.paths.graph_dir, tag)?;
        let knowledge_units = self.knowledge.load(tag)?.then(|| self.knowledge.len());
        let imputation_results = self.results.load(tag)?.then(|| self.results.len());
        Ok(LoadSummary {
            tag,
            graph,
            knowledge_units,
            imputation_results,
        })
    }

    /// Save store, knowledge ledger and results ledger at `tag`.
    pub fn save(&self, tag: u64) -> VistaResult<()> {
        self.store
            .save_alongside(&self.paths.graph_dir, tag, || self.knowledge.save(tag))?;
        self.results.save(tag)?;
        Ok(())
    }

    /// Build segment tasks for the configured window.
    pub fn tasks(&self, table: &TrajectoryTable, mask: &MissingMask, mode: BuildMode) -> VistaResult<Vec<Task>> {
        let ids = table.sequence_ids();
        let end = (self.config.end_point as usize).min(ids.len());
        let start = (self.config.check_point as usize).min(end);
        let window = mask.window(start, end);
        Ok(build_segment_tasks(table, &ids[start..end], &window, mode)?)
    }

    /// Run the graph-construction pipeline over the window.
    pub fn construct_graph(
        &mut self,
        table: &TrajectoryTable,
        mask: &MissingMask,
        extractor: Arc<dyn Extractor>,
        deduplicator: Arc<dyn Deduplicator>,
    ) -> VistaResult<PipelineReport> {
        self.resume_graph()?;
        let tasks = self.tasks(table, mask, BuildMode::GraphConstruction)?;
        let pipeline = ConstructionPipeline::new(
            SchedulerSettings::from_config(&self.config),
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            extractor,
            deduplicator,
            &self.paths.graph_dir,
        );
        Ok(pipeline.run(tasks, &mut self.knowledge)?)
    }

    /// Run the imputation pipeline over the window.
    pub fn impute(
        &mut self,
        table: &TrajectoryTable,
        mask: &MissingMask,
        collaborator: &dyn ImputationCollaborator,
    ) -> VistaResult<PipelineReport> {
        self.resume_results()?;
        let tasks = self.tasks(table, mask, BuildMode::Imputation)?;
        let pipeline = ImputationPipeline::new(
            SchedulerSettings::from_config(&self.config),
            &self.store,
            &self.knowledge,
            collaborator,
            &self.metrics,
        );
        Ok(pipeline.run(tasks, &mut self.results)?)
    }

    /// Restore the store and knowledge ledger saved at `check_point`, so a
    /// resumed run extends the earlier trajectories instead of starting over.
    fn resume_graph(&mut self) -> VistaResult<()> {
        let tag = self.config.check_point;
        if tag == 0 {
            return Ok(());
        }
        let graph = self.store.load(&self.paths.graph_dir, tag)?;
        let ledger = self.knowledge.load(tag)?;
        self.check_resumed_len(tag, self.knowledge.len(), ledger && graph.is_complete(), "knowledge units");
        Ok(())
    }

    /// Restore the results ledger saved at `check_point`.
    fn resume_results(&mut self) -> VistaResult<()> {
        let tag = self.config.check_point;
        if tag == 0 {
            return Ok(());
        }
        let loaded = self.results.load(tag)?;
        self.check_resumed_len(tag, self.results.len(), loaded, "imputation results");
        Ok(())
    }

    fn check_resumed_len(&self, tag: u64, len: usize, complete: bool, what: &str) {
        let expected = tag as usize * self.config.segments_per_trajectory();
        if complete && len == expected {
            tracing::info!(tag, entries = len, what, "resuming from checkpoint");
        } else {
            tracing::warn!(
                tag,
                entries = len,
                expected,
                complete,
                what,
                "checkpoint incomplete, later checkpoints will not line up"
            );
        }
    }

    /// Reuse the graph checkpointed at `end_point_graph` when it exists,
    /// build it otherwise, then impute unless results already exist.
    pub fn run(
        &mut self,
        table: &TrajectoryTable,
        mask: &MissingMask,
        extractor: Arc<dyn Extractor>,
        deduplicator: Arc<dyn Deduplicator>,
        collaborator: &dyn ImputationCollaborator,
    ) -> VistaResult<RunSummary> {
        let tag = self.config.end_point_graph;
        self.store.load(&self.paths.graph_dir, tag)?;
        self.knowledge.load(tag)?;

        let mut summary = RunSummary::default();
        if self.store.is_empty() || self.knowledge.is_empty() {
            tracing::info!(tag, "no reusable graph, constructing");
            summary.construction = Some(self.construct_graph(table, mask, extractor, deduplicator)?);
        } else {
            tracing::info!(tag, units = self.knowledge.len(), "reusing constructed graph");
        }

        self.results.load(tag)?;
        if self.results.is_empty() {
            summary.imputation = Some(self.impute(table, mask, collaborator)?);
        } else {
            tracing::info!(tag, results = self.results.len(), "imputation results exist, skipping");
        }
        Ok(summary)
    }

    pub fn info(&self) -> ExperimentInfo {
        ExperimentInfo {
            exp_name: self.config.exp_name.clone(),
            store: self.store.stats(),
            knowledge_units: self.knowledge.len(),
            imputation_results: self.results.len(),
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn paths(&self) -> &ExperimentPaths {
        &self.paths
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn knowledge(&self) -> &KnowledgeLedger {
        &self.knowledge
    }

    pub fn results(&self) -> &ImputationLedger {
        &self.results
    }

    pub fn metrics(&self) -> &UsageMetrics {
        &self.metrics
    }
}
