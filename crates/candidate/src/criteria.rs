//! Candidate query string builder.
//!
//! Produces queries of the form `Patient?given=Jose,Martin&family=Fernandez`.
//! Every value is percent-encoded on its own, so the `,` list separator and
//! the `&`/`=` delimiters stay unambiguous.
use record::Record;
use tracing::debug;

use crate::error::CandidateError;
use crate::params::{CandidateSearchParam, SearchParamRegistry};

/// Separator between the values of one multi-valued search param.
pub const VALUE_SEPARATOR: char = ',';

/// Builds candidate query strings from a record.
#[derive(Debug, Clone)]
pub struct CandidateSearchCriteriaBuilder {
    registry: SearchParamRegistry,
}

impl CandidateSearchCriteriaBuilder {
    pub fn new(registry: SearchParamRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SearchParamRegistry {
        &self.registry
    }

    /// Build the candidate query for `record`.
    ///
    /// Returns `Ok(None)` only when `search_params` names at least one param,
    /// none of them has a value on the record, and `extra_filters` is empty.
    /// Without configured params the result is `Type?` followed by the
    /// filters. `record` must be of `resource_type`.
    pub fn build_resource_query_string(
        &self,
        resource_type: &str,
        record: &Record,
        extra_filters: &[String],
        search_params: Option<&CandidateSearchParam>,
    ) -> Result<Option<String>, CandidateError> {
        if record.resource_type() != resource_type {
            return Err(CandidateError::ResourceTypeMismatch {
                expected: resource_type.to_string(),
                actual: record.resource_type().to_string(),
            });
        }
        let mut conditions: Vec<String> = Vec::new();
        let configured = search_params.is_some_and(|set| !set.search_params.is_empty());

        if let Some(set) = search_params {
            for param in &set.search_params {
                let values = self.registry.values_for(record, param)?;
                if values.is_empty() {
                    continue;
                }
                let joined = values
                    .iter()
                    .map(|value| urlencoding::encode(&value.search_token()).into_owned())
                    .collect::<Vec<_>>()
                    .join(&VALUE_SEPARATOR.to_string());
                conditions.push(format!("{param}={joined}"));
            }
        }

        if configured && conditions.is_empty() && extra_filters.is_empty() {
            debug!(
                resource_type,
                record_id = record.id(),
                "candidate_query_skipped"
            );
            return Ok(None);
        }

        conditions.extend(extra_filters.iter().cloned());
        let query = format!("{resource_type}?{}", conditions.join("&"));
        debug!(resource_type, record_id = record.id(), query = %query, "candidate_query_built");
        Ok(Some(query))
    }
}

impl Default for CandidateSearchCriteriaBuilder {
    fn default() -> Self {
        Self::new(SearchParamRegistry::default_fhir())
    }
}
