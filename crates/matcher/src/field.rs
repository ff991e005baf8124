//! Field-level comparison.
//!
//! A [`FieldMatcher`] resolves one [`MatchField`] on two records and compares
//! the value lists with the field's [`MatcherKind`]. Multi-valued paths match
//! when any value pair matches, and the reported score is the best pair score.
use record::{FieldValue, Record};
use tracing::trace;

use crate::similarity::{date_parts, digits, normalize, similarity, soundex};
use crate::types::{FieldMatchResult, MatchError, MatchField, MatcherKind};

/// Compares one configured field of two records.
#[derive(Debug, Clone, Copy)]
pub struct FieldMatcher<'a> {
    field: &'a MatchField,
}

impl<'a> FieldMatcher<'a> {
    pub fn new(field: &'a MatchField) -> Self {
        Self { field }
    }

    pub fn field(&self) -> &'a MatchField {
        self.field
    }

    /// Compare the field on both records.
    ///
    /// Fails with [`MatchError::TypeMismatch`] when either record is not of the
    /// field's resource type; the check does not depend on argument order.
    pub fn match_records(
        &self,
        left: &Record,
        right: &Record,
    ) -> Result<FieldMatchResult, MatchError> {
        for record in [left, right] {
            if !self.field.applies_to(record.resource_type()) {
                return Err(MatchError::TypeMismatch {
                    field: self.field.name.clone(),
                    expected: self.field.resource_type.clone(),
                    actual: record.resource_type().to_string(),
                });
            }
        }

        let path = self.field.resource_path.as_str();
        let result = match_values(
            path,
            left.values(path),
            right.values(path),
            &self.field.matcher,
        );

        trace!(
            field = %self.field.name,
            path,
            algorithm = self.field.matcher.name(),
            decision = match (result.skipped, result.matched) {
                (true, _) => "SKIP",
                (false, true) => "YES",
                (false, false) => "NO",
            },
            score = result.score,
            "field_match"
        );
        Ok(result)
    }
}

/// Compare two value lists found at `path` with `kind`.
///
/// Blank values are ignored. Apart from `EMPTY_FIELD`, one empty side never
/// matches and two empty sides yield [`FieldMatchResult::skipped`].
pub fn match_values(
    path: &str,
    left: &[FieldValue],
    right: &[FieldValue],
    kind: &MatcherKind,
) -> FieldMatchResult {
    let left: Vec<&FieldValue> = left.iter().filter(|v| !v.is_blank()).collect();
    let right: Vec<&FieldValue> = right.iter().filter(|v| !v.is_blank()).collect();

    if let MatcherKind::EmptyField { then } = kind {
        return match (left.is_empty(), right.is_empty()) {
            (true, true) => FieldMatchResult::yes(),
            (true, false) | (false, true) => FieldMatchResult::no(),
            (false, false) => best_pair(path, &left, &right, then),
        };
    }

    match (left.is_empty(), right.is_empty()) {
        (true, true) => return FieldMatchResult::skipped(),
        (true, false) | (false, true) => return FieldMatchResult::no(),
        (false, false) => {}
    }
    best_pair(path, &left, &right, kind)
}

fn best_pair(
    path: &str,
    left: &[&FieldValue],
    right: &[&FieldValue],
    kind: &MatcherKind,
) -> FieldMatchResult {
    let mut best = FieldMatchResult::no();
    for a in left {
        for b in right {
            let pair = compare_pair(a, b, kind);
            if (pair.matched && !best.matched) || (pair.matched == best.matched && pair.score > best.score) {
                best = pair;
            }
        }
    }
    trace!(path, matched = best.matched, score = best.score, "field_values_compared");
    best
}

fn compare_pair(left: &FieldValue, right: &FieldValue, kind: &MatcherKind) -> FieldMatchResult {
    match kind {
        MatcherKind::Exact => FieldMatchResult::from_bool(exact_eq(left, right)),
        MatcherKind::String { exact: true } => {
            FieldMatchResult::from_bool(left.as_text().trim() == right.as_text().trim())
        }
        MatcherKind::String { exact: false } => {
            FieldMatchResult::from_bool(normalize(left.as_text()) == normalize(right.as_text()))
        }
        MatcherKind::Substring => {
            let a = normalize(left.as_text());
            let b = normalize(right.as_text());
            FieldMatchResult::from_bool(a.starts_with(&b) || b.starts_with(&a))
        }
        MatcherKind::Numeric => {
            let a = digits(left.as_text());
            FieldMatchResult::from_bool(!a.is_empty() && a == digits(right.as_text()))
        }
        MatcherKind::Date => FieldMatchResult::from_bool(dates_agree(left.as_text(), right.as_text())),
        MatcherKind::Identifier { system } => {
            FieldMatchResult::from_bool(identifiers_agree(left, right, system.as_deref()))
        }
        MatcherKind::Soundex => match (soundex(left.as_text()), soundex(right.as_text())) {
            (Some(a), Some(b)) => FieldMatchResult::from_bool(a == b),
            _ => FieldMatchResult::no(),
        },
        MatcherKind::Similarity {
            metric,
            match_threshold,
        } => {
            let score = similarity(*metric, left.as_text(), right.as_text());
            FieldMatchResult {
                matched: score >= *match_threshold,
                score,
                skipped: false,
            }
        }
        // Blank handling already happened in `match_values`; a nested
        // comparison only sees populated values.
        MatcherKind::EmptyField { then } => compare_pair(left, right, then),
    }
}

fn exact_eq(left: &FieldValue, right: &FieldValue) -> bool {
    match (left, right) {
        (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
        (FieldValue::Identifier { .. }, FieldValue::Identifier { .. }) => left == right,
        _ => left.as_text() == right.as_text(),
    }
}

fn dates_agree(left: &str, right: &str) -> bool {
    let a = date_parts(left);
    let b = date_parts(right);
    let shared = a.len().min(b.len());
    shared > 0 && a[..shared] == b[..shared]
}

fn identifiers_agree(left: &FieldValue, right: &FieldValue, pinned: Option<&str>) -> bool {
    let (
        FieldValue::Identifier {
            system: left_system,
            value: left_value,
        },
        FieldValue::Identifier {
            system: right_system,
            value: right_value,
        },
    ) = (left, right)
    else {
        return false;
    };
    if let Some(pinned) = pinned {
        if left_system.as_deref() != Some(pinned) || right_system.as_deref() != Some(pinned) {
            return false;
        }
    }
    left_system == right_system && left_value.trim() == right_value.trim()
}
