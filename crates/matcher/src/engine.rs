use std::time::Instant;

use rayon::prelude::*;
use record::Record;
use tracing::{debug, trace};

use crate::field::FieldMatcher;
use crate::metrics::metrics_recorder;
use crate::trace::{FieldTrace, MatchOutcome};
use crate::types::{split_field_set, MatchError, MatchField, MatchResult, MatchRules};


/// Scores record pairs of a single resource type.
///
/// Built once from [`MatchRules`]; only fields declared for this type (or
/// `*`) take part, in declaration order. Scoring never mutates the matcher,
/// so one instance can be shared across threads.
#[derive(Debug, Clone)]
pub struct ResourceMatcher {
    resource_type: String,
    rules: MatchRules,
    fields: Vec<MatchField>,
    result_map: Vec<(Vec<String>, MatchResult)>,
}

impl ResourceMatcher {
    /// Validate `rules` and select the fields applicable to `resource_type`.
    pub fn new(resource_type: &str, rules: MatchRules) -> Result<Self, MatchError> {
        rules.validate()?;

        let fields: Vec<MatchField> = rules
            .match_fields
            .iter()
            .filter(|f| f.applies_to(resource_type))
            .cloned()
            .collect();
        if fields.is_empty() {
            return Err(MatchError::InvalidRules(format!(
                "no match field applies to resource type {resource_type}"
            )));
        }

        // Entries naming a field of another type can never be satisfied here.
        let result_map = rules
            .match_result_map
            .iter()
            .filter_map(|(key, result)| {
                let names: Vec<String> = split_field_set(key).map(str::to_string).collect();
                let applicable = !names.is_empty()
                    && names
                        .iter()
                        .all(|name| fields.iter().any(|f| &f.name == name));
                applicable.then_some((names, *result))
            })
            .collect();

        Ok(Self {
            resource_type: resource_type.to_string(),
            rules,
            fields,
            result_map,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn rules(&self) -> &MatchRules {
        &self.rules
    }

    /// Fields taking part in scoring, in evaluation order.
    pub fn fields(&self) -> &[MatchField] {
        &self.fields
    }

    /// Compare two records of this matcher's resource type.
    pub fn match_records(&self, left: &Record, right: &Record) -> Result<MatchOutcome, MatchError> {
        for record in [left, right] {
            if record.resource_type() != self.resource_type {
                return Err(MatchError::ResourceTypeMismatch {
                    expected: self.resource_type.clone(),
                    actual: record.resource_type().to_string(),
                });
            }
        }

        let start = Instant::now();
        let mut traces = Vec::with_capacity(self.fields.len());
        let mut matched_weight = 0.0;
        let mut compared_weight = 0.0;
        for field in &self.fields {
            let result = FieldMatcher::new(field).match_records(left, right)?;
            if !result.skipped {
                compared_weight += field.weight;
            }
            if result.matched {
                matched_weight += field.weight;
            }
            traces.push(FieldTrace {
                field: field.name.clone(),
                path: field.resource_path.clone(),
                algorithm: field.matcher.name().to_string(),
                matched: result.matched,
                score: result.score,
                weight: field.weight,
                skipped: result.skipped,
            });
        }

        // Fields empty on both records are left out of the denominator. With
        // nothing compared there is no evidence, and the pair scores zero.
        let score = if compared_weight > 0.0 {
            (matched_weight / compared_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let result = self.classify(score, &traces);

        let outcome = MatchOutcome {
            left: left.reference(),
            right: right.reference(),
            result,
            score,
            fields: traces,
        };

        let latency = start.elapsed();
        trace!(
            resource_type = %self.resource_type,
            fields = ?outcome.summary_lines(),
            "resource_match_fields"
        );
        debug!(
            resource_type = %self.resource_type,
            left = %outcome.left,
            right = %outcome.right,
            result = %outcome.result,
            score = outcome.score,
            elapsed_micros = latency.as_micros() as u64,
            "resource_match"
        );
        if let Some(recorder) = metrics_recorder() {
            recorder.record_match(&self.resource_type, result, latency);
        }

        Ok(outcome)
    }

    /// Score `source` against every candidate in parallel.
    ///
    /// Outcomes keep the order of `candidates`. The first error aborts the batch.
    pub fn match_candidates(
        &self,
        source: &Record,
        candidates: &[Record],
    ) -> Result<Vec<MatchOutcome>, MatchError> {
        candidates
            .par_iter()
            .map(|candidate| self.match_records(source, candidate))
            .collect()
    }

    /// Threshold classification, raised by any satisfied `match_result_map`
    /// entry.
    pub fn classify(&self, score: f64, fields: &[FieldTrace]) -> MatchResult {
        let by_threshold = if score >= self.rules.match_threshold {
            MatchResult::Match
        } else if score >= self.rules.possible_match_threshold {
            MatchResult::PossibleMatch
        } else {
            MatchResult::NoMatch
        };

        self.result_map
            .iter()
            .filter(|(names, _)| {
                names.iter().all(|name| {
                    fields
                        .iter()
                        .any(|trace| trace.matched && &trace.field == name)
                })
            })
            .map(|(_, result)| *result)
            .fold(by_threshold, MatchResult::max)
    }
}
