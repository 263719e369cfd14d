//! Knowledge graph: a weighted three-partite graph of static attributes,
//! behaviour patterns and spatial functions.
//!
//! - **Static-attribute nodes** are keyed by `(attribute, value)` and carry
//!   weighted edges to behaviour nodes.
//! - **Behaviour nodes** ([`BehaviorId`]) are identified by a digest of their
//!   canonicalised five pattern fields, which is what deduplicates repeated
//!   observations.
//! - **Function nodes** ([`FunctionId`]) are identified by a digest of their
//!   trimmed code body and can be merged into one another.
//!
//! All mutation goes through [`store::KnowledgeStore`].

pub mod candidates;
pub mod dictionary;
pub mod induced;
pub mod persist;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use unicode_normalization::UnicodeNormalization;

use crate::error::GraphError;

/// Static-attribute keys used for bookkeeping, never turned into graph nodes.
pub const RESERVED_KEYS: [&str; 3] = ["block", "seq", "MMSI"];

/// Stored in place of a pattern field the producer left out.
pub const UNKNOWN_FIELD: &str = "unknown";

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

macro_rules! content_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:016x}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = GraphError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let malformed = || GraphError::MalformedId {
                    kind: $kind,
                    raw: s.to_string(),
                };
                let hex = s.trim().strip_prefix($prefix).ok_or_else(malformed)?;
                if hex.len() != 16 {
                    return Err(malformed());
                }
                u64::from_str_radix(hex, 16).map(Self).map_err(|_| malformed())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

content_id!(
    /// Identity of a behaviour node: digest of its canonical pattern fields.
    BehaviorId,
    "vb_",
    "behaviour"
);

content_id!(
    /// Identity of a function node: digest of its trimmed code.
    FunctionId,
    "vf_",
    "function"
);

/// First eight bytes of the blake3 digest, little-endian.
fn content_digest(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Any node of the graph, addressed by kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Static { attribute: String, value: String },
    Behavior(BehaviorId),
    Function(FunctionId),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Static { attribute, value } => write!(f, "vs_{attribute}_{value}"),
            NodeId::Behavior(id) => write!(f, "{id}"),
            NodeId::Function(id) => write!(f, "{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern fields
// ---------------------------------------------------------------------------

/// The five fields that make up a behaviour pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternField {
    #[serde(rename = "speed_profile")]
    Speed,
    #[serde(rename = "course_change")]
    Course,
    #[serde(rename = "heading_fluctuation")]
    Heading,
    #[serde(rename = "intent")]
    Intent,
    #[serde(rename = "duration")]
    Duration,
}

impl PatternField {
    pub const ALL: [PatternField; 5] = [
        PatternField::Speed,
        PatternField::Course,
        PatternField::Heading,
        PatternField::Intent,
        PatternField::Duration,
    ];

    /// Fields that have a pattern dictionary (duration is computed, not generated).
    pub const DICTIONARY: [PatternField; 4] = [
        PatternField::Speed,
        PatternField::Course,
        PatternField::Heading,
        PatternField::Intent,
    ];

    pub fn key(self) -> &'static str {
        match self {
            PatternField::Speed => "speed_profile",
            PatternField::Course => "course_change",
            PatternField::Heading => "heading_fluctuation",
            PatternField::Intent => "intent",
            PatternField::Duration => "duration",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key.trim())
    }
}

impl fmt::Display for PatternField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Canonical form of a pattern value: text before the first `(` or `:`,
/// NFKC-normalised, lower-cased, whitespace collapsed.
///
/// `"Fast (12 knots)"`, `"fast: 12kn"` and `" FAST "` all canonicalise to `"fast"`.
pub fn canonicalize(value: &str) -> String {
    let head = value.split(['(', ':']).next().unwrap_or_default();
    head.nfkc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Knowledge units (producer-facing)
// ---------------------------------------------------------------------------

/// Per-segment static attributes (`v_s`), including reserved bookkeeping keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticAttributes(pub BTreeMap<String, serde_json::Value>);

impl StaticAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Attribute value as graph-key text; non-string values use their JSON rendering.
    pub fn text(&self, key: &str) -> Option<String> {
        self.0.get(key).map(value_text)
    }

    /// Non-reserved `(attribute, value)` pairs.
    pub fn descriptive(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.0
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), value_text(v)))
    }

    pub fn mmsi(&self) -> Option<u64> {
        self.integer("MMSI")
    }

    pub fn sequence(&self) -> Option<u64> {
        self.integer("seq")
    }

    pub fn block(&self) -> Option<u64> {
        self.integer("block")
    }

    fn integer(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<u64>()
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as u64)),
            _ => None,
        }
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A behaviour pattern as produced by extraction (`v_b`). Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BehaviorPattern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_change: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_fluctuation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Free-text rationale from the producer.
    #[serde(default, rename = "llm_output")]
    pub rationale: String,
}

impl BehaviorPattern {
    pub fn field(&self, field: PatternField) -> Option<&str> {
        match field {
            PatternField::Speed => self.speed_profile.as_deref(),
            PatternField::Course => self.course_change.as_deref(),
            PatternField::Heading => self.heading_fluctuation.as_deref(),
            PatternField::Intent => self.intent.as_deref(),
            PatternField::Duration => self.duration.as_deref(),
        }
    }

    pub fn set_field(&mut self, field: PatternField, value: impl Into<String>) {
        let slot = match field {
            PatternField::Speed => &mut self.speed_profile,
            PatternField::Course => &mut self.course_change,
            PatternField::Heading => &mut self.heading_fluctuation,
            PatternField::Intent => &mut self.intent,
            PatternField::Duration => &mut self.duration,
        };
        *slot = Some(value.into());
    }

    /// True when none of the five fields is present.
    pub fn is_empty(&self) -> bool {
        PatternField::ALL.iter().all(|f| self.field(*f).is_none())
    }

    /// Canonical content id; `None` for an empty pattern.
    pub fn canonical_id(&self) -> Option<BehaviorId> {
        if self.is_empty() {
            return None;
        }
        let content: BTreeMap<&str, String> = PatternField::ALL
            .iter()
            .filter_map(|f| self.field(*f).map(|v| (f.key(), canonicalize(v))))
            .collect();
        let encoded = serde_json::to_string(&content).unwrap_or_default();
        Some(BehaviorId(content_digest(encoded.as_bytes())))
    }
}

/// A spatial function as produced by extraction (`v_f`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialFunction {
    #[serde(default, rename = "describe_of_function")]
    pub description: String,
    #[serde(default, rename = "spatial_function")]
    pub code: String,
    /// Set when the function was replaced by an already-stored one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vf_id: Option<FunctionId>,
}

impl SpatialFunction {
    pub fn new(description: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            code: code.into(),
            vf_id: None,
        }
    }

    /// Content id of the trimmed code; `None` when there is no code.
    pub fn id(&self) -> Option<FunctionId> {
        let code = self.code.trim();
        (!code.is_empty()).then(|| FunctionId(content_digest(code.as_bytes())))
    }
}

/// One mined unit of knowledge: `{v_s, v_b, v_f}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeUnit {
    #[serde(default)]
    pub v_s: StaticAttributes,
    #[serde(default)]
    pub v_b: Option<BehaviorPattern>,
    #[serde(default)]
    pub v_f: Option<SpatialFunction>,
}

impl KnowledgeUnit {
    /// The placeholder shape recorded for segments that produced nothing.
    pub fn placeholder() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Stored nodes
// ---------------------------------------------------------------------------

/// A stored behaviour node; fields keep the raw (unstripped) text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorNode {
    pub speed_profile: String,
    pub course_change: String,
    pub heading_fluctuation: String,
    pub intent: String,
    pub duration: String,
    #[serde(default, rename = "llm_output")]
    pub rationale: String,
}

impl BehaviorNode {
    /// Build from a pattern, defaulting absent fields to [`UNKNOWN_FIELD`].
    pub fn from_pattern(pattern: &BehaviorPattern) -> Self {
        let raw = |f| {
            pattern
                .field(f)
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| UNKNOWN_FIELD.to_string())
        };
        Self {
            speed_profile: raw(PatternField::Speed),
            course_change: raw(PatternField::Course),
            heading_fluctuation: raw(PatternField::Heading),
            intent: raw(PatternField::Intent),
            duration: raw(PatternField::Duration),
            rationale: pattern.rationale.clone(),
        }
    }

    pub fn field(&self, field: PatternField) -> &str {
        match field {
            PatternField::Speed => &self.speed_profile,
            PatternField::Course => &self.course_change,
            PatternField::Heading => &self.heading_fluctuation,
            PatternField::Intent => &self.intent,
            PatternField::Duration => &self.duration,
        }
    }
}

/// A stored function node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub description: String,
    pub code: String,
}

/// A static-attribute node with its behaviour edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticAttributeNode {
    pub attribute: String,
    pub value: String,
    pub behaviors: BTreeMap<BehaviorId, u64>,
}

/// Any node of the graph, as returned by [`store::KnowledgeStore::node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Static(StaticAttributeNode),
    Behavior(BehaviorNode),
    Function(FunctionNode),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(speed: &str) -> BehaviorPattern {
        BehaviorPattern {
            speed_profile: Some(speed.into()),
            course_change: Some("stable".into()),
            heading_fluctuation: Some("stable".into()),
            intent: Some("fleeing".into()),
            duration: Some("0~50".into()),
            rationale: String::new(),
        }
    }

    #[test]
    fn canonicalize_strips_suffixes_case_and_whitespace() {
        assert_eq!(canonicalize("fast (12 knots)"), "fast");
        assert_eq!(canonicalize("Slow  Drift: 2kn"), "slow drift");
        assert_eq!(canonicalize("  STABLE "), "stable");
        assert_eq!(canonicalize("(only suffix)"), "");
    }

    #[test]
    fn parenthetical_suffix_does_not_change_identity() {
        let a = pattern("fast").canonical_id().unwrap();
        let b = pattern("fast (12 knots)").canonical_id().unwrap();
        let c = pattern("slow").canonical_id().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn empty_pattern_has_no_id() {
        let empty = BehaviorPattern {
            rationale: "nothing found".into(),
            ..Default::default()
        };
        assert!(empty.canonical_id().is_none());
    }

    #[test]
    fn ids_roundtrip_through_text() {
        let id = pattern("fast").canonical_id().unwrap();
        let text = id.to_string();
        assert!(text.starts_with("vb_") && text.len() == 19);
        assert_eq!(text.parse::<BehaviorId>().unwrap(), id);
        assert!(text.parse::<FunctionId>().is_err());
        assert!("vf_xyz".parse::<FunctionId>().is_err());
    }

    #[test]
    fn ids_serialize_as_map_keys() {
        let id = FunctionId::from_raw(0xabc);
        let map = BTreeMap::from([(id, 3u64)]);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"vf_0000000000000abc":3}"#);
        let back: BTreeMap<FunctionId, u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn function_id_ignores_surrounding_whitespace() {
        let a = SpatialFunction::new("", "def f():\n    return 1\n");
        let b = SpatialFunction::new("other", "  def f():\n    return 1");
        assert_eq!(a.id(), b.id());
        assert!(SpatialFunction::new("d", "   ").id().is_none());
    }

    #[test]
    fn static_attributes_skip_reserved_keys() {
        let vs = StaticAttributes::new()
            .with("MMSI", 219_000_001u64)
            .with("seq", "12")
            .with("block", 3)
            .with("vessel_type", "Cargo")
            .with("draught", "[6, 8) m");
        let pairs: Vec<_> = vs.descriptive().collect();
        assert_eq!(
            pairs,
            vec![("draught", "[6, 8) m".to_string()), ("vessel_type", "Cargo".to_string())]
        );
        assert_eq!(vs.mmsi(), Some(219_000_001));
        assert_eq!(vs.sequence(), Some(12));
        assert_eq!(vs.block(), Some(3));
    }

    #[test]
    fn behavior_node_defaults_missing_fields() {
        let node = BehaviorNode::from_pattern(&BehaviorPattern {
            speed_profile: Some(" fast (12 knots) ".into()),
            ..Default::default()
        });
        assert_eq!(node.speed_profile, "fast (12 knots)");
        assert_eq!(node.intent, UNKNOWN_FIELD);
    }

    #[test]
    fn placeholder_unit_serializes_with_null_behavior() {
        let json = serde_json::to_value(KnowledgeUnit::placeholder()).unwrap();
        assert_eq!(json["v_b"], serde_json::Value::Null);
        assert_eq!(json["v_f"], serde_json::Value::Null);
        assert_eq!(json["v_s"], serde_json::json!({}));
    }
}
