//! Search parameter configuration.
//!
//! A search parameter is the public name used in candidate queries (`given`,
//! `identifier`, ...). The [`SearchParamRegistry`] resolves it to the record
//! paths holding its values for a given resource type.
use std::collections::BTreeMap;

use record::{FieldValue, Record, IDENTIFIER_PATH};
use serde::{Deserialize, Serialize};

use crate::error::CandidateError;

/// One set of search params used to pull candidates for a resource type.
///
/// Several sets for the same type run as separate queries whose results are
/// unioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSearchParam {
    pub resource_type: String,
    pub search_params: Vec<String>,
}

impl CandidateSearchParam {
    pub fn new<I, S>(resource_type: &str, search_params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resource_type: resource_type.to_string(),
            search_params: search_params.into_iter().map(Into::into).collect(),
        }
    }
}

/// A fixed condition added to every candidate query of a resource type,
/// e.g. `active=true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFilterParam {
    pub resource_type: String,
    pub search_param: String,
    pub fixed_value: String,
}

impl CandidateFilterParam {
    pub fn new(resource_type: &str, search_param: &str, fixed_value: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            search_param: search_param.to_string(),
            fixed_value: fixed_value.to_string(),
        }
    }

    /// Pre-formed query fragment, appended to queries as is.
    pub fn to_query_fragment(&self) -> String {
        format!("{}={}", self.search_param, self.fixed_value)
    }
}

/// Filter fragments configured for `resource_type`, in configuration order.
pub fn filter_fragments(filters: &[CandidateFilterParam], resource_type: &str) -> Vec<String> {
    filters
        .iter()
        .filter(|f| f.resource_type == resource_type)
        .map(CandidateFilterParam::to_query_fragment)
        .collect()
}

/// Maps `(resource type, search param)` to record paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchParamRegistry {
    params: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl SearchParamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Common person-like search params for `Patient`, `Practitioner`,
    /// `Person`, `RelatedPerson` and `Organization`.
    pub fn default_fhir() -> Self {
        let mut registry = Self::new();
        for resource_type in ["Patient", "Practitioner", "Person", "RelatedPerson"] {
            registry.register(resource_type, "given", ["name.given"]);
            registry.register(resource_type, "family", ["name.family"]);
            registry.register(
                resource_type,
                "name",
                ["name.text", "name.given", "name.family"],
            );
            registry.register(resource_type, "identifier", [IDENTIFIER_PATH]);
            registry.register(resource_type, "gender", ["gender"]);
            registry.register(resource_type, "telecom", ["telecom.value"]);
            registry.register(resource_type, "phone", ["telecom.value"]);
            registry.register(resource_type, "email", ["telecom.value"]);
            registry.register(resource_type, "address", ["address.line", "address.city"]);
            registry.register(resource_type, "address-city", ["address.city"]);
            registry.register(resource_type, "address-postalcode", ["address.postalCode"]);
            registry.register(resource_type, "active", ["active"]);
        }
        for resource_type in ["Patient", "Person", "RelatedPerson"] {
            registry.register(resource_type, "birthdate", ["birthDate"]);
        }
        registry.register("Patient", "general-practitioner", ["generalPractitioner.reference"]);
        registry.register("Patient", "organization", ["managingOrganization.reference"]);

        registry.register("Organization", "name", ["name", "alias"]);
        registry.register("Organization", "identifier", [IDENTIFIER_PATH]);
        registry.register("Organization", "active", ["active"]);
        registry.register("Organization", "address-city", ["address.city"]);
        registry.register("Organization", "phone", ["telecom.value"]);
        registry
    }

    /// Add or replace the paths of a search param.
    pub fn register<I, S>(&mut self, resource_type: &str, search_param: &str, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params
            .entry(resource_type.to_string())
            .or_default()
            .insert(
                search_param.to_string(),
                paths.into_iter().map(Into::into).collect(),
            );
    }

    /// Merge `other` over `self`; entries of `other` win.
    pub fn extend(&mut self, other: SearchParamRegistry) {
        for (resource_type, params) in other.params {
            self.params.entry(resource_type).or_default().extend(params);
        }
    }

    pub fn paths(&self, resource_type: &str, search_param: &str) -> Option<&[String]> {
        self.params
            .get(resource_type)
            .and_then(|params| params.get(search_param))
            .map(Vec::as_slice)
    }

    /// Like [`paths`](Self::paths) but an unknown param is an error.
    pub fn resolve(&self, resource_type: &str, search_param: &str) -> Result<&[String], CandidateError> {
        self.paths(resource_type, search_param)
            .ok_or_else(|| CandidateError::UnknownSearchParam {
                resource_type: resource_type.to_string(),
                search_param: search_param.to_string(),
            })
    }

    /// Populated values of `search_param` on `record`, in path then record
    /// order, without duplicates.
    pub fn values_for<'r>(
        &self,
        record: &'r Record,
        search_param: &str,
    ) -> Result<Vec<&'r FieldValue>, CandidateError> {
        let paths = self.resolve(record.resource_type(), search_param)?;
        let mut values: Vec<&'r FieldValue> = Vec::new();
        for path in paths {
            for value in record.populated_values(path) {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }

    /// Check that every search param of `set` is known.
    pub fn validate(&self, set: &CandidateSearchParam) -> Result<(), CandidateError> {
        for param in &set.search_params {
            self.resolve(&set.resource_type, param)?;
        }
        Ok(())
    }
}
