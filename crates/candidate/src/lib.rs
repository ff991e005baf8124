//! # MDM Candidate Search (`candidate`)
//!
//! Pre-filters the records a new or changed record is scored against.
//!
//! The [`CandidateSearchCriteriaBuilder`] turns a record and a
//! [`CandidateSearchParam`] set into a URL query string such as
//! `Patient?given=Jose,Martin&family=Fernandez`. The [`CandidateSearcher`]
//! runs those queries against a [`RecordRepository`] and returns the union of
//! the matches, capped by a configurable limit.
//!
//! ```
//! use candidate::{CandidateSearchCriteriaBuilder, CandidateSearchParam};
//! use record::Record;
//!
//! let builder = CandidateSearchCriteriaBuilder::default();
//! let patient = Record::new("Patient", "a")
//!     .with_text("name.given", "Jose")
//!     .with_text("name.family", "Fernandez");
//! let params = CandidateSearchParam::new("Patient", ["given", "family"]);
//!
//! let query = builder
//!     .build_resource_query_string("Patient", &patient, &[], Some(&params))
//!     .unwrap();
//! assert_eq!(query.as_deref(), Some("Patient?given=Jose&family=Fernandez"));
//! ```

mod criteria;
mod error;
mod params;
mod query;
mod search;

pub use crate::criteria::{CandidateSearchCriteriaBuilder, VALUE_SEPARATOR};
pub use crate::error::{CandidateError, RepositoryError};
pub use crate::params::{
    filter_fragments, CandidateFilterParam, CandidateSearchParam, SearchParamRegistry,
};
pub use crate::query::{CandidateQuery, QueryCondition, QueryModifier};
pub use crate::search::{
    CandidateSearcher, InMemoryRecordRepository, RecordRepository, DEFAULT_CANDIDATE_SEARCH_LIMIT,
};
