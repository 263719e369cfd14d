//! Redundancy analysis of one extracted batch.
//!
//! Before a batch is committed, newly seen pattern terms and new function
//! bodies are shown to a [`Deduplicator`] together with what the store
//! already knows. Its decisions fold redundant terms into primary terms and
//! redundant functions into a surviving function:
//!
//! - stored functions in one group are merged in the store;
//! - a pending function (not yet committed, referenced as `temp_vf_<i>`)
//!   grouped with a stored one takes the stored function's content;
//! - pending functions grouped only with each other take the primary's
//!   content.
//!
//! Merge chains (`a → b → c`) are followed to their end; a cycle stops at
//! the first repeated node.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::collab::{CollabContext, Deduplicator, Extraction};
use crate::graph::dictionary::TermRemap;
use crate::graph::store::KnowledgeStore;
use crate::graph::{FunctionId, KnowledgeUnit, PatternField, SpatialFunction, canonicalize};

const PENDING_PREFIX: &str = "temp_vf_";

static ENTRY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-\s*(?P<primary>[^|]+?)\s*\|\s*\[?(?P<redundant>[^\]]*)\]?\s*$").unwrap()
});

/// A function as seen by redundancy analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunctionRef {
    /// Already in the store.
    Stored(FunctionId),
    /// Carried by the batch unit at this index.
    Pending(usize),
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionRef::Stored(id) => write!(f, "{id}"),
            FunctionRef::Pending(i) => write!(f, "{PENDING_PREFIX}{i}"),
        }
    }
}

impl FromStr for FunctionRef {
    type Err = crate::error::GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches(['"', '\'', '`']);
        if let Some(index) = s.strip_prefix(PENDING_PREFIX) {
            return index
                .parse()
                .map(FunctionRef::Pending)
                .map_err(|_| crate::error::GraphError::MalformedId {
                    kind: "pending function",
                    raw: s.to_string(),
                });
        }
        s.parse().map(FunctionRef::Stored)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A new pattern term to check against the dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct TermReview {
    /// Index of the unit in the batch.
    pub index: usize,
    pub field: PatternField,
    pub current: String,
}

/// A function body to compare.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSample {
    pub reference: FunctionRef,
    pub description: String,
    pub code: String,
}

/// Everything a [`Deduplicator`] is asked about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupRequest {
    pub terms: Vec<TermReview>,
    /// Dictionary values of every field that has a term under review.
    pub known_terms: BTreeMap<PatternField, Vec<String>>,
    /// Empty unless at least two functions can be compared.
    pub functions: Vec<FunctionSample>,
}

impl DedupRequest {
    pub fn prepare(store: &KnowledgeStore, batch: &[Extraction]) -> Self {
        let dictionaries = store.dictionaries();
        let mut request = DedupRequest::default();

        for (index, extraction) in batch.iter().enumerate() {
            let Some(pattern) = &extraction.unit.v_b else {
                continue;
            };
            for field in PatternField::DICTIONARY {
                if !extraction.new_values.get(field) {
                    continue;
                }
                let Some(current) = pattern.field(field) else {
                    continue;
                };
                request.terms.push(TermReview {
                    index,
                    field,
                    current: current.to_string(),
                });
                request.known_terms.entry(field).or_insert_with(|| {
                    dictionaries
                        .values(field)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default()
                });
            }
        }

        let mut functions: Vec<FunctionSample> = batch
            .iter()
            .enumerate()
            .filter(|(_, e)| e.new_function)
            .filter_map(|(i, e)| {
                let vf = e.unit.v_f.as_ref()?;
                (!vf.code.trim().is_empty()).then(|| FunctionSample {
                    reference: vf.vf_id.map_or(FunctionRef::Pending(i), FunctionRef::Stored),
                    description: vf.description.clone(),
                    code: vf.code.clone(),
                })
            })
            .collect();
        functions.extend(store.function_nodes().into_iter().map(|(id, node)| FunctionSample {
            reference: FunctionRef::Stored(id),
            description: node.description,
            code: node.code,
        }));
        if functions.len() > 1 {
            request.functions = functions;
        }
        request
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.functions.is_empty()
    }

    /// Plain-text rendering for text-based analysers.
    pub fn render(&self, batch: &[Extraction]) -> String {
        let mut out = String::new();
        if !self.terms.is_empty() {
            out.push_str("BEHAVIOR PATTERNS:\n");
            for review in &self.terms {
                let vs = batch.get(review.index).map(|e| &e.unit.v_s);
                let seq = vs.and_then(|v| v.sequence()).map_or("unknown".into(), |s| s.to_string());
                let block = vs.and_then(|v| v.block()).map_or("unknown".into(), |b| b.to_string());
                out.push_str(&format!(
                    "\nVB {} (Sequence {seq}, Segment {block}):\n  Attribute: {}\n  Current value: {}\n",
                    review.index, review.field, review.current
                ));
                let known = self.known_terms.get(&review.field).map(Vec::as_slice).unwrap_or(&[]);
                out.push_str(&format!("  Dictionary values ({}):\n", known.len()));
                for value in known {
                    out.push_str(&format!("    - {value}\n"));
                }
            }
        }
        if !self.functions.is_empty() {
            out.push_str("\nSPATIAL FUNCTIONS:\n");
            for sample in &self.functions {
                let source = match sample.reference {
                    FunctionRef::Stored(_) => "graph",
                    FunctionRef::Pending(_) => "current batch",
                };
                out.push_str(&format!(
                    "\nFunction ID: {} (from {source}):\n```python\n{}\n```\n",
                    sample.reference, sample.code
                ));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Redundancy decisions for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedundancyDecisions {
    /// `{field: {redundant: primary}}`.
    pub terms: TermRemap,
    /// `redundant → primary`.
    pub functions: BTreeMap<FunctionRef, FunctionRef>,
}

impl RedundancyDecisions {
    pub fn is_empty(&self) -> bool {
        self.terms.values().all(BTreeMap::is_empty) && self.functions.is_empty()
    }

    /// Parse the text format:
    ///
    /// ```text
    /// BEHAVIOR_REDUNDANCY:
    /// speed_profile:
    /// - fast | [quick, rapid]
    /// KEEP_UNIQUE: [...]
    /// FUNCTION_REDUNDANCY:
    /// - vf_00000000000000aa | [temp_vf_2, vf_00000000000000bb]
    /// KEEP_UNIQUE: [...]
    /// ```
    ///
    /// Unknown fields and malformed ids are skipped.
    pub fn parse(text: &str) -> Self {
        let mut decisions = RedundancyDecisions::default();

        if let Some(section) = section(text, "BEHAVIOR_REDUNDANCY:") {
            let mut current: Option<PatternField> = None;
            for line in section.lines().map(str::trim) {
                if let Some((primary, redundant)) = entry(line) {
                    let Some(field) = current else { continue };
                    let slot = decisions.terms.entry(field).or_default();
                    for term in redundant {
                        if term != primary {
                            slot.insert(term, primary.clone());
                        }
                    }
                } else if let Some(header) = line.strip_suffix(':') {
                    current = PatternField::from_key(header.trim_matches(['[', ']', ' ']));
                    if current.is_none() {
                        tracing::warn!(header, "unknown pattern field in redundancy response");
                    }
                }
            }
        }

        if let Some(section) = section(text, "FUNCTION_REDUNDANCY:") {
            for line in section.lines().map(str::trim) {
                let Some((primary, redundant)) = entry(line) else {
                    continue;
                };
                let Ok(primary) = primary.parse::<FunctionRef>() else {
                    tracing::warn!(primary, "unparseable primary function id");
                    continue;
                };
                for raw in redundant {
                    match raw.parse::<FunctionRef>() {
                        Ok(r) if r != primary => {
                            decisions.functions.insert(r, primary);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "unparseable redundant function id"),
                    }
                }
            }
        }

        decisions
    }

    /// Final target of `start` along the redundancy chain.
    pub fn resolve(&self, start: FunctionRef) -> FunctionRef {
        let mut visited = HashSet::new();
        let mut current = start;
        while visited.insert(current) {
            match self.functions.get(&current) {
                Some(next) if *next != current => current = *next,
                _ => break,
            }
        }
        current
    }

    /// Groups of `(survivor, members)` after chain resolution.
    pub fn function_groups(&self) -> BTreeMap<FunctionRef, Vec<FunctionRef>> {
        let mut groups: BTreeMap<FunctionRef, Vec<FunctionRef>> = BTreeMap::new();
        for redundant in self.functions.keys() {
            let target = self.resolve(*redundant);
            if target != *redundant {
                groups.entry(target).or_default().push(*redundant);
            }
        }
        groups
    }
}

/// Text between `marker` and the next `KEEP_UNIQUE:` or section marker.
fn section<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let (_, rest) = text.split_once(marker)?;
    let end = ["KEEP_UNIQUE:", "BEHAVIOR_REDUNDANCY:", "FUNCTION_REDUNDANCY:"]
        .iter()
        .filter_map(|m| rest.find(m))
        .min()
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// `- primary | [a, b]` → `("primary", ["a", "b"])`.
fn entry(line: &str) -> Option<(String, Vec<String>)> {
    let caps = ENTRY_LINE.captures(line)?;
    let unquote = |s: &str| s.trim().trim_matches(['"', '\'']).trim().to_string();
    let primary = unquote(&caps["primary"]);
    let redundant = caps["redundant"]
        .split(',')
        .map(unquote)
        .filter(|s| !s.is_empty())
        .collect();
    (!primary.is_empty()).then_some((primary, redundant))
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// What applying decisions changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub terms_cleaned: usize,
    pub terms_rewritten: usize,
    pub functions_merged: usize,
    pub pending_replaced: usize,
}

/// Apply `decisions` to the store and to the batch's units.
pub fn apply(
    store: &KnowledgeStore,
    decisions: &RedundancyDecisions,
    batch: &mut [Extraction],
) -> ApplyReport {
    let mut report = ApplyReport {
        terms_cleaned: store.clean_dictionaries(&decisions.terms),
        ..Default::default()
    };

    for extraction in batch.iter_mut() {
        let Some(pattern) = extraction.unit.v_b.as_mut() else {
            continue;
        };
        for (field, remap) in &decisions.terms {
            let Some(current) = pattern.field(*field).map(canonicalize) else {
                continue;
            };
            let hit = remap
                .iter()
                .find(|(redundant, _)| {
                    let redundant = canonicalize(redundant);
                    !redundant.is_empty() && current.contains(&redundant)
                })
                .map(|(_, primary)| primary.clone());
            if let Some(primary) = hit {
                pattern.set_field(*field, primary);
                report.terms_rewritten += 1;
            }
        }
    }

    for (target, members) in decisions.function_groups() {
        let mut stored: Vec<FunctionId> = Vec::new();
        let mut pending: Vec<usize> = Vec::new();
        for member in std::iter::once(target).chain(members) {
            match member {
                FunctionRef::Stored(id) => stored.push(id),
                FunctionRef::Pending(i) => pending.push(i),
            }
        }

        if let Some((&survivor, others)) = stored.split_first() {
            for other in others {
                if store.merge_function_nodes(survivor, *other) {
                    report.functions_merged += 1;
                }
            }
            let Some(node) = store.function_node(survivor) else {
                tracing::warn!(%survivor, "surviving function missing, pending functions kept");
                continue;
            };
            for i in pending {
                if let Some(extraction) = batch.get_mut(i) {
                    extraction.unit.v_f = Some(SpatialFunction {
                        description: node.description.clone(),
                        code: node.code.clone(),
                        vf_id: Some(survivor),
                    });
                    extraction.new_function = false;
                    report.pending_replaced += 1;
                }
            }
        } else if let Some((&primary, others)) = pending.split_first() {
            let Some(content) = batch.get(primary).and_then(|e| e.unit.v_f.clone()) else {
                continue;
            };
            for i in others {
                if let Some(extraction) = batch.get_mut(*i) {
                    extraction.unit.v_f = Some(content.clone());
                    report.pending_replaced += 1;
                }
            }
        }
    }

    report
}

/// Run redundancy analysis over a batch and return the units to commit.
///
/// A failing analyser leaves the batch unchanged.
pub fn deduplicate_batch(
    ctx: &CollabContext<'_>,
    deduplicator: &dyn Deduplicator,
    mut batch: Vec<Extraction>,
) -> Vec<KnowledgeUnit> {
    let request = DedupRequest::prepare(ctx.store, &batch);
    if !request.is_empty() {
        match deduplicator.analyze(ctx, &request) {
            Ok(decisions) if !decisions.is_empty() => {
                let report = apply(ctx.store, &decisions, &mut batch);
                tracing::info!(
                    units = batch.len(),
                    terms_cleaned = report.terms_cleaned,
                    terms_rewritten = report.terms_rewritten,
                    functions_merged = report.functions_merged,
                    pending_replaced = report.pending_replaced,
                    "redundancy applied"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, units = batch.len(), "redundancy analysis failed"),
        }
    }
    batch.into_iter().map(|e| e.unit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::dictionary::NewValueFlags;
    use crate::graph::{BehaviorPattern, StaticAttributes};

    fn stored(code: &str) -> FunctionId {
        SpatialFunction::new("", code).id().unwrap()
    }

    fn extraction(speed: &str, code: Option<&str>, new_function: bool) -> Extraction {
        Extraction {
            unit: KnowledgeUnit {
                v_s: StaticAttributes::new().with("vessel_type", "Cargo"),
                v_b: Some(BehaviorPattern {
                    speed_profile: Some(speed.into()),
                    ..Default::default()
                }),
                v_f: code.map(|c| SpatialFunction::new("desc", c)),
            },
            new_values: NewValueFlags {
                speed_profile: true,
                ..Default::default()
            },
            new_function,
        }
    }

    fn store_with(codes: &[&str]) -> KnowledgeStore {
        let store = KnowledgeStore::new();
        for code in codes {
            store.update_graph(&extraction("steady", Some(code), false).unit);
        }
        store
    }

    #[test]
    fn function_ref_text_roundtrip() {
        let id = stored("a()");
        assert_eq!(FunctionRef::Stored(id).to_string().parse::<FunctionRef>().unwrap(), FunctionRef::Stored(id));
        assert_eq!("temp_vf_3".parse::<FunctionRef>().unwrap(), FunctionRef::Pending(3));
        assert_eq!("'temp_vf_0'".parse::<FunctionRef>().unwrap(), FunctionRef::Pending(0));
        assert!("temp_vf_x".parse::<FunctionRef>().is_err());
        assert!("vf_nothex".parse::<FunctionRef>().is_err());
    }

    #[test]
    fn parse_both_sections() {
        let a = stored("a()");
        let text = format!(
            "BEHAVIOR_REDUNDANCY:\n\
             speed_profile:\n\
             - fast | [quick, \"rapid\", fast]\n\
             [intent]:\n\
             - fishing | [trawling]\n\
             colour:\n\
             - red | [crimson]\n\
             KEEP_UNIQUE: [slow]\n\
             FUNCTION_REDUNDANCY:\n\
             - {a} | [temp_vf_1, temp_vf_2, garbage]\n\
             KEEP_UNIQUE: []\n"
        );
        let d = RedundancyDecisions::parse(&text);
        let speed = &d.terms[&PatternField::Speed];
        assert_eq!(speed.len(), 2);
        assert_eq!(speed["quick"], "fast");
        assert_eq!(speed["rapid"], "fast");
        assert_eq!(d.terms[&PatternField::Intent]["trawling"], "fishing");
        assert_eq!(d.terms.len(), 2);
        assert_eq!(d.functions.len(), 2);
        assert_eq!(d.functions[&FunctionRef::Pending(1)], FunctionRef::Stored(a));
    }

    #[test]
    fn parse_without_sections_is_empty() {
        assert!(RedundancyDecisions::parse("nothing to report").is_empty());
    }

    #[test]
    fn chains_resolve_and_cycles_stop() {
        let mut d = RedundancyDecisions::default();
        d.functions.insert(FunctionRef::Pending(0), FunctionRef::Pending(1));
        d.functions.insert(FunctionRef::Pending(1), FunctionRef::Pending(2));
        assert_eq!(d.resolve(FunctionRef::Pending(0)), FunctionRef::Pending(2));

        d.functions.insert(FunctionRef::Pending(2), FunctionRef::Pending(0));
        // Cycle: stops at the first repeated node.
        assert_eq!(d.resolve(FunctionRef::Pending(0)), FunctionRef::Pending(0));
        assert_eq!(d.resolve(FunctionRef::Pending(7)), FunctionRef::Pending(7));
    }

    #[test]
    fn prepare_collects_new_terms_and_functions() {
        let store = store_with(&["old()"]);
        store.register_patterns(&BehaviorPattern {
            speed_profile: Some("steady".into()),
            ..Default::default()
        });
        let batch = vec![
            extraction("fast", Some("new()"), true),
            extraction("slow", None, false),
        ];
        let request = DedupRequest::prepare(&store, &batch);
        assert_eq!(request.terms.len(), 2);
        assert_eq!(request.known_terms[&PatternField::Speed], vec!["steady".to_string()]);
        assert_eq!(request.functions.len(), 2);
        assert_eq!(request.functions[0].reference, FunctionRef::Pending(0));
        assert!(request.render(&batch).contains("temp_vf_0"));
    }

    #[test]
    fn single_function_sample_is_skipped() {
        let store = KnowledgeStore::new();
        let batch = vec![extraction("fast", Some("only()"), true)];
        let request = DedupRequest::prepare(&store, &batch);
        assert!(request.functions.is_empty());
    }

    #[test]
    fn stored_group_merges_and_replaces_pending() {
        let store = store_with(&["a()", "b()"]);
        let (a, b) = (stored("a()"), stored("b()"));
        let mut batch = vec![
            extraction("quick (14 kn)", Some("c()"), true),
            extraction("slow", Some("d()"), true),
        ];
        let mut d = RedundancyDecisions::default();
        d.terms.insert(
            PatternField::Speed,
            BTreeMap::from([("quick".to_string(), "fast".to_string())]),
        );
        d.functions.insert(FunctionRef::Stored(b), FunctionRef::Stored(a));
        d.functions.insert(FunctionRef::Pending(0), FunctionRef::Stored(b));
        d.functions.insert(FunctionRef::Pending(1), FunctionRef::Pending(0));

        let report = apply(&store, &d, &mut batch);
        assert_eq!(report.functions_merged, 1);
        assert_eq!(report.pending_replaced, 2);
        assert_eq!(report.terms_rewritten, 1);
        assert!(store.function_node(b).is_none());
        assert_eq!(batch[0].unit.v_b.as_ref().unwrap().speed_profile.as_deref(), Some("fast"));
        for e in &batch {
            let vf = e.unit.v_f.as_ref().unwrap();
            assert_eq!(vf.vf_id, Some(a));
            assert_eq!(vf.code, "a()");
        }
    }

    #[test]
    fn pending_only_group_copies_primary() {
        let store = KnowledgeStore::new();
        let mut batch = vec![
            extraction("fast", Some("p()"), true),
            extraction("fast", Some("q()"), true),
        ];
        let mut d = RedundancyDecisions::default();
        d.functions.insert(FunctionRef::Pending(1), FunctionRef::Pending(0));
        let report = apply(&store, &d, &mut batch);
        assert_eq!(report.pending_replaced, 1);
        assert_eq!(batch[1].unit.v_f.as_ref().unwrap().code, "p()");
    }
}
