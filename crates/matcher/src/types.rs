use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource type wildcard accepted by [`MatchField::resource_type`].
pub const ANY_RESOURCE_TYPE: &str = "*";

/// Classification of a record pair.
///
/// Variants are ordered from weakest to strongest so that `max` picks the
/// most confident verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchResult {
    NoMatch,
    PossibleMatch,
    Match,
}

impl MatchResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchResult::NoMatch => "NO_MATCH",
            MatchResult::PossibleMatch => "POSSIBLE_MATCH",
            MatchResult::Match => "MATCH",
        }
    }

    /// Anything stronger than `NO_MATCH`.
    pub fn is_candidate(&self) -> bool {
        *self != MatchResult::NoMatch
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String similarity metric used by [`MatcherKind::Similarity`].
///
/// All metrics are normalized to `[0.0, 1.0]`, where `1.0` means identical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimilarityMetric {
    JaroWinkler,
    Jaro,
    Levenshtein,
    DamerauLevenshtein,
    SorensenDice,
}

/// Comparison algorithm for a single field.
///
/// Selected once when rules are loaded. The serialized form is tagged by
/// `algorithm`, e.g. `{ algorithm: SIMILARITY, metric: JARO_WINKLER,
/// match_threshold: 0.8 }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "algorithm", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatcherKind {
    /// Values are identical. Identifiers compare system and value.
    Exact,
    /// Text equality. Non-exact mode ignores case, accents and extra whitespace.
    String {
        #[serde(default)]
        exact: bool,
    },
    /// One normalized value is a prefix of the other.
    Substring,
    /// Values agree once everything but ASCII digits is dropped.
    Numeric,
    /// Dates agree at the coarser of the two precisions.
    Date,
    /// Identifiers with the same system and value, optionally pinned to one system.
    Identifier {
        #[serde(default)]
        system: Option<String>,
    },
    /// American Soundex codes are equal.
    Soundex,
    /// Graded similarity; the field matches once the score reaches the threshold.
    Similarity {
        metric: SimilarityMetric,
        match_threshold: f64,
    },
    /// Both sides empty matches, exactly one empty does not, and two
    /// populated sides are compared with `then`.
    EmptyField { then: Box<MatcherKind> },
}

impl MatcherKind {
    pub fn name(&self) -> &'static str {
        match self {
            MatcherKind::Exact => "EXACT",
            MatcherKind::String { .. } => "STRING",
            MatcherKind::Substring => "SUBSTRING",
            MatcherKind::Numeric => "NUMERIC",
            MatcherKind::Date => "DATE",
            MatcherKind::Identifier { .. } => "IDENTIFIER",
            MatcherKind::Soundex => "SOUNDEX",
            MatcherKind::Similarity { .. } => "SIMILARITY",
            MatcherKind::EmptyField { .. } => "EMPTY_FIELD",
        }
    }

    fn validate(&self, field: &str) -> Result<(), MatchError> {
        match self {
            MatcherKind::Similarity {
                match_threshold, ..
            } => {
                if !(0.0..=1.0).contains(match_threshold) {
                    return Err(MatchError::InvalidRules(format!(
                        "field `{field}`: similarity match_threshold must be between 0.0 and 1.0"
                    )));
                }
                Ok(())
            }
            MatcherKind::EmptyField { then } => {
                if matches!(**then, MatcherKind::EmptyField { .. }) {
                    return Err(MatchError::InvalidRules(format!(
                        "field `{field}`: EMPTY_FIELD cannot delegate to another EMPTY_FIELD"
                    )));
                }
                then.validate(field)
            }
            _ => Ok(()),
        }
    }
}

/// One configured comparison between two records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchField {
    /// Name used in traces and in `match_result_map` keys.
    pub name: String,
    /// Resource type this field applies to, or `*`.
    #[serde(default = "MatchField::default_resource_type")]
    pub resource_type: String,
    /// Dotted record path, e.g. `name.given`.
    pub resource_path: String,
    pub matcher: MatcherKind,
    /// Contribution of this field to the normalized score.
    #[serde(default = "MatchField::default_weight")]
    pub weight: f64,
}

impl MatchField {
    pub(crate) fn default_resource_type() -> String {
        ANY_RESOURCE_TYPE.to_string()
    }

    pub(crate) fn default_weight() -> f64 {
        1.0
    }

    pub fn new(name: &str, resource_type: &str, resource_path: &str, matcher: MatcherKind) -> Self {
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            resource_path: resource_path.to_string(),
            matcher,
            weight: Self::default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.resource_type == ANY_RESOURCE_TYPE || self.resource_type == resource_type
    }
}

/// Full matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchRules {
    /// Fields in evaluation order.
    #[serde(default)]
    pub match_fields: Vec<MatchField>,
    /// Scores at or above this are `MATCH`.
    #[serde(default = "MatchRules::default_match_threshold")]
    pub match_threshold: f64,
    /// Scores at or above this (and below `match_threshold`) are `POSSIBLE_MATCH`.
    #[serde(default = "MatchRules::default_possible_match_threshold")]
    pub possible_match_threshold: f64,
    /// Comma-separated field-name sets that force a minimum result when all
    /// of their fields match, e.g. `"given,family": MATCH`.
    #[serde(default)]
    pub match_result_map: BTreeMap<String, MatchResult>,
}

impl MatchRules {
    pub(crate) fn default_match_threshold() -> f64 {
        0.8
    }

    pub(crate) fn default_possible_match_threshold() -> f64 {
        0.5
    }

    /// Validate thresholds, fields and result map keys.
    pub fn validate(&self) -> Result<(), MatchError> {
        if self.match_fields.is_empty() {
            return Err(MatchError::InvalidRules(
                "match_fields must not be empty".into(),
            ));
        }
        for (label, value) in [
            ("match_threshold", self.match_threshold),
            ("possible_match_threshold", self.possible_match_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MatchError::InvalidRules(format!(
                    "{label} must be between 0.0 and 1.0"
                )));
            }
        }
        if self.possible_match_threshold > self.match_threshold {
            return Err(MatchError::InvalidRules(
                "possible_match_threshold must not exceed match_threshold".into(),
            ));
        }

        let mut names = HashSet::new();
        for field in &self.match_fields {
            if field.name.trim().is_empty() {
                return Err(MatchError::InvalidRules(
                    "match field name must not be empty".into(),
                ));
            }
            if !names.insert(field.name.as_str()) {
                return Err(MatchError::InvalidRules(format!(
                    "duplicate match field `{}`",
                    field.name
                )));
            }
            if field.resource_path.trim().is_empty() {
                return Err(MatchError::InvalidRules(format!(
                    "field `{}`: resource_path must not be empty",
                    field.name
                )));
            }
            if !(field.weight.is_finite() && field.weight > 0.0) {
                return Err(MatchError::InvalidRules(format!(
                    "field `{}`: weight must be a positive number",
                    field.name
                )));
            }
            field.matcher.validate(&field.name)?;
        }

        for key in self.match_result_map.keys() {
            for name in split_field_set(key) {
                if !names.contains(name) {
                    return Err(MatchError::InvalidRules(format!(
                        "match_result_map entry `{key}` references unknown field `{name}`"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            match_fields: Vec::new(),
            match_threshold: Self::default_match_threshold(),
            possible_match_threshold: Self::default_possible_match_threshold(),
            match_result_map: BTreeMap::new(),
        }
    }
}

/// Split a `match_result_map` key into field names.
pub(crate) fn split_field_set(key: &str) -> impl Iterator<Item = &str> {
    key.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Result of comparing one field of two records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldMatchResult {
    pub matched: bool,
    /// `1.0`/`0.0` for boolean matchers, the similarity for graded ones.
    pub score: f64,
    /// Neither side had a value, so the field carries no evidence either way.
    #[serde(default)]
    pub skipped: bool,
}

impl FieldMatchResult {
    pub fn yes() -> Self {
        Self {
            matched: true,
            score: 1.0,
            skipped: false,
        }
    }

    pub fn no() -> Self {
        Self {
            matched: false,
            score: 0.0,
            skipped: false,
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::no()
        }
    }

    pub fn from_bool(matched: bool) -> Self {
        if matched {
            Self::yes()
        } else {
            Self::no()
        }
    }
}

/// Errors produced by the matching layer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatchError {
    /// Rules failed validation.
    #[error("invalid match rules: {0}")]
    InvalidRules(String),
    /// A record handed to a field matcher is not of the field's resource type.
    #[error("field `{field}` is declared for resource type {expected} but was given {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },
    /// A record handed to a resource matcher is not of its resource type.
    #[error("resource type mismatch: expected {expected} but was given {actual}")]
    ResourceTypeMismatch { expected: String, actual: String },
}
