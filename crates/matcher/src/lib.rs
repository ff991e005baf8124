//! # MDM Matcher (`matcher`)
//!
//! ## Purpose
//!
//! `matcher` decides whether two [`Record`](record::Record)s describe the same
//! real-world entity. It is the scoring half of the MDM core: the candidate
//! layer finds plausible records, this crate grades them, and the link layer
//! persists the verdict.
//!
//! ## Core Types
//!
//! - [`MatcherKind`]: the comparison algorithm for one field, selected when the
//!   rules are loaded:
//!   - `Exact`, `String`, `Substring`, `Numeric`, `Date`, `Identifier`,
//!     `Soundex`: boolean comparisons.
//!   - `Similarity`: graded string similarity with a per-field threshold.
//!   - `EmptyField`: matches when both sides are empty, delegates otherwise.
//! - [`MatchField`]: name + resource type + path + matcher + weight.
//! - [`MatchRules`]: the ordered field list, thresholds and result map.
//! - [`ResourceMatcher`]: scores a record pair for one resource type and
//!   returns a [`MatchOutcome`] with a per-field trace.
//!
//! ## Example Usage
//!
//! ```
//! use matcher::{MatchField, MatchResult, MatchRules, MatcherKind, ResourceMatcher, SimilarityMetric};
//! use record::Record;
//!
//! let rules = MatchRules {
//!     match_fields: vec![
//!         MatchField::new("given", "Patient", "name.given", MatcherKind::Similarity {
//!             metric: SimilarityMetric::JaroWinkler,
//!             match_threshold: 0.85,
//!         }),
//!         MatchField::new("family", "Patient", "name.family", MatcherKind::String { exact: false }),
//!     ],
//!     ..MatchRules::default()
//! };
//! let matcher = ResourceMatcher::new("Patient", rules).expect("valid rules");
//!
//! let left = Record::new("Patient", "a").with_text("name.given", "Jonathan").with_text("name.family", "Smith");
//! let right = Record::new("Patient", "b").with_text("name.given", "Jonathon").with_text("name.family", "SMITH");
//!
//! let outcome = matcher.match_records(&left, &right).expect("same type");
//! assert_eq!(outcome.result, MatchResult::Match);
//! println!("{}", outcome.trace());
//! ```
//!
//! ## Observability
//!
//! Every field decision is emitted as a `TRACE` event and the classification as
//! a `DEBUG` event. The same information is returned in
//! [`MatchOutcome::fields`], so tests and audit tooling never need to scrape
//! logs. Install a [`MatchMetrics`] implementation via [`set_match_metrics`]
//! to record per-pair latency and results.

pub mod engine;
pub mod field;
pub mod metrics;
pub mod similarity;
pub mod trace;
pub mod types;

pub use crate::engine::ResourceMatcher;
pub use crate::field::{match_values, FieldMatcher};
pub use crate::metrics::{set_match_metrics, MatchMetrics};
pub use crate::trace::{FieldTrace, MatchOutcome, TraceDisplay};
pub use crate::types::{
    FieldMatchResult, MatchError, MatchField, MatchResult, MatchRules, MatcherKind,
    SimilarityMetric, ANY_RESOURCE_TYPE,
};
