//! Structured match traces.
//!
//! The trace is part of the matcher's contract, not a logging side effect:
//! [`MatchOutcome::fields`] holds one [`FieldTrace`] per evaluated field and
//! [`MatchOutcome::trace`] renders the human-readable form:
//!
//! ```text
//! given: YES (score 1.000, weight 1.0)
//! family: NO (score 0.000, weight 1.0)
//! Patient/a vs Patient/b: POSSIBLE_MATCH (score 0.500)
//! ```
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::MatchResult;

/// Decision for one field of a record pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTrace {
    pub field: String,
    pub path: String,
    pub algorithm: String,
    pub matched: bool,
    pub score: f64,
    pub weight: f64,
    /// Left out of the score because neither record had a value.
    #[serde(default)]
    pub skipped: bool,
}

impl FieldTrace {
    pub fn decision(&self) -> &'static str {
        if self.skipped {
            "SKIP"
        } else if self.matched {
            "YES"
        } else {
            "NO"
        }
    }
}

impl fmt::Display for FieldTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (score {:.3}, weight {:.1})",
            self.field,
            self.decision(),
            self.score,
            self.weight
        )
    }
}

/// Result of comparing two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// `Type/id` of the left record.
    pub left: String,
    /// `Type/id` of the right record.
    pub right: String,
    pub result: MatchResult,
    /// Matched weight over the weight of non-skipped fields, in `[0.0, 1.0]`.
    pub score: f64,
    /// Field decisions in evaluation order.
    pub fields: Vec<FieldTrace>,
}

impl MatchOutcome {
    pub fn field(&self, name: &str) -> Option<&FieldTrace> {
        self.fields.iter().find(|f| f.field == name)
    }

    pub fn matched_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.matched)
            .map(|f| f.field.as_str())
    }

    /// `"name: YES|NO|SKIP"` lines, one per field.
    pub fn summary_lines(&self) -> Vec<String> {
        self.fields
            .iter()
            .map(|f| format!("{}: {}", f.field, f.decision()))
            .collect()
    }

    /// Text adapter for human logs.
    pub fn trace(&self) -> TraceDisplay<'_> {
        TraceDisplay { outcome: self }
    }
}

/// Formats a [`MatchOutcome`] as a multi-line trace.
pub struct TraceDisplay<'a> {
    outcome: &'a MatchOutcome,
}

impl fmt::Display for TraceDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.outcome.fields {
            writeln!(f, "{field}")?;
        }
        write!(
            f,
            "{} vs {}: {} (score {:.3})",
            self.outcome.left, self.outcome.right, self.outcome.result, self.outcome.score
        )
    }
}
