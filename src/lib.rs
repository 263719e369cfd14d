// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # vista-kg
//!
//! Vessel-trajectory imputation driven by a shared weighted knowledge graph.
//!
//! ## Architecture
//!
//! - **Knowledge store** (`graph`): static-attribute, behaviour and function
//!   nodes with weighted edges, pattern dictionaries, multiplicative top-k
//!   candidate ranking, function-node merging and tag-keyed JSON checkpoints
//! - **Ledgers** (`ledger`): append-only knowledge-unit and imputation-result
//!   lists with checkpoint files
//! - **Task builder** (`task`): trajectory table + missing mask → segment tasks
//! - **Failure classifier** (`classify`): accept, retry or record a placeholder
//! - **Redundancy** (`redundancy`): folds redundant pattern terms and functions
//! - **Schedulers** (`pipeline`): batch-barrier worker pools for graph
//!   construction and imputation with trajectory-count checkpoints
//! - **Collaborators** (`collab`): the traits external producers implement
//!
//! ## Library usage
//!
//! ```no_run
//! use vista_kg::graph::store::KnowledgeStore;
//! use vista_kg::graph::{BehaviorPattern, KnowledgeUnit, StaticAttributes};
//!
//! let store = KnowledgeStore::new();
//! let vs = StaticAttributes::new().with("vessel_type", "Fishing");
//! store.update_graph(&KnowledgeUnit {
//!     v_s: vs.clone(),
//!     v_b: Some(BehaviorPattern {
//!         speed_profile: Some("slow".into()),
//!         intent: Some("fishing".into()),
//!         ..Default::default()
//!     }),
//!     v_f: None,
//! });
//! let ranked = store.select_behavior_candidates(&[&vs], 5);
//! assert_eq!(ranked.len(), 1);
//! ```

pub mod classify;
pub mod collab;
pub mod config;
pub mod error;
pub mod experiment;
pub mod graph;
pub mod ledger;
pub mod paths;
pub mod pipeline;
pub mod redundancy;
pub mod task;
pub mod trajectory;
