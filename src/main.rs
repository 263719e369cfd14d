//! vista CLI: inspect and drive a vessel-trajectory knowledge graph.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vista_kg::collab::{NoRedundancy, ReplayExtractor};
use vista_kg::config::ExperimentConfig;
use vista_kg::experiment::Experiment;
use vista_kg::graph::{BehaviorId, FunctionId, KnowledgeUnit, PatternField, StaticAttributes};
use vista_kg::paths::ExperimentPaths;
use vista_kg::trajectory::{MissingMask, TrajectoryTable};

#[derive(Parser)]
#[command(name = "vista", version, about = "Vessel trajectory knowledge graph")]
struct Cli {
    /// Config file (default: <results-root>/<exp>/vista.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Experiment name override.
    #[arg(long, global = true)]
    exp: Option<String>,

    /// Results root override.
    #[arg(long, global = true)]
    results_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config into the experiment directory.
    Init,

    /// Show store and ledger statistics at a checkpoint tag.
    Info {
        #[arg(long, default_value = "0")]
        tag: u64,
    },

    /// Rank behaviours for static attributes, then functions for those behaviours.
    Candidates {
        #[arg(long, default_value = "0")]
        tag: u64,
        /// Static attribute as `key=value`; repeatable.
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
        /// Override top_k from the config.
        #[arg(long)]
        k: Option<usize>,
    },

    /// Print the induced subgraph of a candidate query as Graphviz DOT.
    Subgraph {
        #[arg(long, default_value = "0")]
        tag: u64,
        #[arg(long = "attr", value_parser = parse_attr)]
        attrs: Vec<(String, String)>,
        #[arg(long)]
        k: Option<usize>,
    },

    /// Print one behaviour (`vb_…`) or function (`vf_…`) node with its edges.
    Show {
        #[arg(long, default_value = "0")]
        tag: u64,
        id: String,
    },

    /// Merge function node SOURCE into TARGET and re-save the tag.
    Merge {
        #[arg(long)]
        tag: u64,
        target: String,
        source: String,
    },

    /// Run graph construction over pre-extracted knowledge units.
    Replay {
        /// JSON array of knowledge units (each with `seq` and `block` in `v_s`).
        #[arg(long)]
        units: PathBuf,
        /// JSON trajectory table (`{"rows": [...]}`).
        #[arg(long)]
        table: PathBuf,
        /// JSON 0/1 missing mask, one row per sequence.
        #[arg(long)]
        mask: PathBuf,
    },
}

fn parse_attr(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let paths = ExperimentPaths::for_config(&config);
    paths.ensure_dirs()?;
    init_tracing(&paths.logs_dir)?;

    match cli.command {
        Commands::Init => {
            let target = cli.config.clone().unwrap_or_else(|| paths.config_file());
            config.save(&target)?;
            println!("Initialized experiment `{}` at {}", config.exp_name, paths.root.display());
            println!("Config written to {}", target.display());
        }

        Commands::Info { tag } => {
            let mut exp = Experiment::new(config)?;
            let summary = exp.load(tag)?;
            if !summary.graph.is_complete() {
                println!("(tag {tag}: {} graph file(s) missing)", summary.graph.missing.len());
            }
            println!("{}", exp.info());
        }

        Commands::Candidates { tag, attrs, k } => {
            let mut exp = Experiment::new(config)?;
            exp.load(tag)?;
            let k = k.unwrap_or(exp.config().top_k);
            let query = query_attributes(&attrs);
            let behaviors = exp.store().select_behavior_candidates(&[&query], k);
            if behaviors.is_empty() {
                println!("No behaviour candidates.");
                return Ok(());
            }
            println!("Behaviours:");
            for c in &behaviors {
                println!(
                    "  {} {:.4}  speed={} course={} heading={} intent={} duration={}",
                    c.id,
                    c.score,
                    c.node.speed_profile,
                    c.node.course_change,
                    c.node.heading_fluctuation,
                    c.node.intent,
                    c.node.duration
                );
            }
            let ids: Vec<BehaviorId> = behaviors.iter().map(|c| c.id).collect();
            let functions = exp.store().select_function_candidates(&ids, k);
            println!("Functions:");
            for c in &functions {
                println!("  {} {:.4}  {}", c.id, c.score, c.node.description);
            }
        }

        Commands::Subgraph { tag, attrs, k } => {
            let mut exp = Experiment::new(config)?;
            exp.load(tag)?;
            let k = k.unwrap_or(exp.config().top_k);
            let query = query_attributes(&attrs);
            let behaviors: Vec<BehaviorId> = exp
                .store()
                .select_behavior_candidates(&[&query], k)
                .into_iter()
                .map(|c| c.id)
                .collect();
            let functions: Vec<FunctionId> = exp
                .store()
                .select_function_candidates(&behaviors, k)
                .into_iter()
                .map(|c| c.id)
                .collect();
            println!(
                "{}",
                exp.store().render_induced_subgraph(&[&query], &behaviors, &functions)
            );
        }

        Commands::Show { tag, id } => {
            let mut exp = Experiment::new(config)?;
            exp.load(tag)?;
            if id.starts_with("vb_") {
                let vb: BehaviorId = id.parse()?;
                let node = exp.store().require_behavior(vb)?;
                println!("{vb}");
                for field in PatternField::ALL {
                    println!("  {:<20} {}", field.key(), node.field(field));
                }
                if let Some(links) = exp.store().behavior_links(vb) {
                    for (attr, values) in &links.statics {
                        for (value, w) in values {
                            println!("  <- {attr}={value} (w={w})");
                        }
                    }
                    for (vf, w) in &links.functions {
                        println!("  -> {vf} (w={w})");
                    }
                }
            } else {
                let vf: FunctionId = id.parse()?;
                let node = exp.store().require_function(vf)?;
                println!("{vf}: {}", node.description);
                for (vb, w) in exp.store().function_links(vf).unwrap_or_default() {
                    println!("  <- {vb} (w={w})");
                }
                println!("{}", node.code);
            }
        }

        Commands::Merge { tag, target, source } => {
            let target: FunctionId = target.parse()?;
            let source: FunctionId = source.parse()?;
            let mut exp = Experiment::new(config)?;
            exp.load(tag)?;
            exp.store().require_function(target)?;
            exp.store().require_function(source)?;
            if exp.store().merge_function_nodes(target, source) {
                exp.save(tag)?;
                println!("Merged {source} into {target} (tag {tag} re-saved)");
            } else {
                println!("Nothing merged: {source} and {target} are the same node");
            }
        }

        Commands::Replay { units, table, mask } => {
            let units: Vec<KnowledgeUnit> = read_json(&units)?;
            let table: TrajectoryTable = read_json(&table)?;
            let bits: Vec<Vec<u8>> = read_json(&mask)?;
            let mask = MissingMask::from_bits(&bits);

            let extractor = ReplayExtractor::new(units);
            println!("Replaying {} knowledge unit(s)", extractor.len());
            let mut exp = Experiment::new(config)?;
            let report = exp
                .construct_graph(&table, &mask, Arc::new(extractor), Arc::new(NoRedundancy))?;
            println!(
                "dispatched={} accepted={} retried={} gave_up={} checkpoints={:?}",
                report.dispatched, report.accepted, report.retried, report.gave_up, report.checkpoints
            );
            println!("{}", exp.info());
        }
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<ExperimentConfig> {
    let mut config = match &cli.config {
        Some(path) if path.exists() => ExperimentConfig::load(path)?,
        Some(_) => ExperimentConfig::default(),
        None => {
            let mut probe = ExperimentConfig::default();
            if let Some(name) = &cli.exp {
                probe.exp_name = name.clone();
            }
            if let Some(root) = &cli.results_root {
                probe.results_root = root.clone();
            }
            let candidate = ExperimentPaths::for_config(&probe).config_file();
            if candidate.exists() {
                ExperimentConfig::load(&candidate)?
            } else {
                probe
            }
        }
    };
    if let Some(name) = &cli.exp {
        config.exp_name = name.clone();
    }
    if let Some(root) = &cli.results_root {
        config.results_root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Log to stdout and to `logs/run_<timestamp>.log`.
fn init_tracing(logs_dir: &Path) -> Result<()> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_path = logs_dir.join(format!("run_{stamp}.log"));
    let file = std::fs::File::create(&log_path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to create log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

fn query_attributes(attrs: &[(String, String)]) -> StaticAttributes {
    attrs
        .iter()
        .fold(StaticAttributes::new(), |vs, (k, v)| vs.with(k, v.as_str()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to parse {}", path.display()))
}
