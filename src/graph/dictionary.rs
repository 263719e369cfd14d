//! Pattern dictionaries: previously seen canonical values per pattern field.
//!
//! Producers use them to reuse existing vocabulary, and the redundancy pass
//! uses them to fold near-duplicate terms into a primary term.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{BehaviorPattern, PatternField, canonicalize};

/// `{field: {redundant_term: primary_term}}` as decided by redundancy analysis.
pub type TermRemap = BTreeMap<PatternField, BTreeMap<String, String>>;

/// The four pattern dictionaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDictionaries {
    #[serde(default)]
    pub speed_profile: BTreeSet<String>,
    #[serde(default)]
    pub course_change: BTreeSet<String>,
    #[serde(default)]
    pub heading_fluctuation: BTreeSet<String>,
    #[serde(default)]
    pub intent: BTreeSet<String>,
}

/// Which pattern fields carried a value not yet in the dictionaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewValueFlags {
    pub speed_profile: bool,
    pub course_change: bool,
    pub heading_fluctuation: bool,
    pub intent: bool,
}

impl NewValueFlags {
    pub fn get(&self, field: PatternField) -> bool {
        match field {
            PatternField::Speed => self.speed_profile,
            PatternField::Course => self.course_change,
            PatternField::Heading => self.heading_fluctuation,
            PatternField::Intent => self.intent,
            PatternField::Duration => false,
        }
    }

    pub fn set(&mut self, field: PatternField, value: bool) {
        match field {
            PatternField::Speed => self.speed_profile = value,
            PatternField::Course => self.course_change = value,
            PatternField::Heading => self.heading_fluctuation = value,
            PatternField::Intent => self.intent = value,
            PatternField::Duration => {}
        }
    }

    pub fn any(&self) -> bool {
        PatternField::DICTIONARY.iter().any(|f| self.get(*f))
    }
}

impl PatternDictionaries {
    pub fn values(&self, field: PatternField) -> Option<&BTreeSet<String>> {
        match field {
            PatternField::Speed => Some(&self.speed_profile),
            PatternField::Course => Some(&self.course_change),
            PatternField::Heading => Some(&self.heading_fluctuation),
            PatternField::Intent => Some(&self.intent),
            PatternField::Duration => None,
        }
    }

    fn values_mut(&mut self, field: PatternField) -> Option<&mut BTreeSet<String>> {
        match field {
            PatternField::Speed => Some(&mut self.speed_profile),
            PatternField::Course => Some(&mut self.course_change),
            PatternField::Heading => Some(&mut self.heading_fluctuation),
            PatternField::Intent => Some(&mut self.intent),
            PatternField::Duration => None,
        }
    }

    pub fn contains(&self, field: PatternField, value: &str) -> bool {
        self.values(field)
            .is_some_and(|set| set.contains(&canonicalize(value)))
    }

    /// Total number of terms across the four dictionaries.
    pub fn len(&self) -> usize {
        PatternField::DICTIONARY
            .iter()
            .filter_map(|f| self.values(*f))
            .map(BTreeSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add the pattern's canonical values, flagging those not seen before.
    pub fn register(&mut self, pattern: &BehaviorPattern) -> NewValueFlags {
        let mut flags = NewValueFlags::default();
        for field in PatternField::DICTIONARY {
            let Some(raw) = pattern.field(field) else {
                continue;
            };
            let term = canonicalize(raw);
            if term.is_empty() {
                continue;
            }
            if let Some(set) = self.values_mut(field) {
                flags.set(field, set.insert(term));
            }
        }
        flags
    }

    /// Replace redundant terms by their primary term. Returns the number of
    /// redundant terms removed.
    pub fn clean(&mut self, remap: &TermRemap) -> usize {
        let mut cleaned = 0;
        for (field, pairs) in remap {
            let Some(set) = self.values_mut(*field) else {
                continue;
            };
            for (redundant, primary) in pairs {
                let redundant = canonicalize(redundant);
                let primary = canonicalize(primary);
                if redundant == primary || !set.contains(&redundant) {
                    continue;
                }
                set.insert(primary);
                set.remove(&redundant);
                cleaned += 1;
            }
        }
        cleaned
    }
}
