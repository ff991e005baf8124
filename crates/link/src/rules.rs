use std::collections::BTreeMap;

use candidate::{
    CandidateFilterParam, CandidateSearchParam, SearchParamRegistry, DEFAULT_CANDIDATE_SEARCH_LIMIT,
};
use matcher::{MatchRules, ResourceMatcher};
use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// Complete MDM configuration: which types are linked, how candidates are
/// found and how they are scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdmRules {
    /// Resource types that take part in linking.
    #[serde(default)]
    pub mdm_types: Vec<String>,
    #[serde(default)]
    pub candidate_search_params: Vec<CandidateSearchParam>,
    #[serde(default)]
    pub candidate_filter_params: Vec<CandidateFilterParam>,
    /// Extra or overriding search param paths, merged over the FHIR defaults.
    #[serde(default)]
    pub search_param_paths: SearchParamRegistry,
    /// Enterprise identifier system per resource type.
    #[serde(default)]
    pub eid_systems: BTreeMap<String, String>,
    #[serde(default = "MdmRules::default_candidate_search_limit")]
    pub candidate_search_limit: usize,
    /// Attempts after the first one when a link commit hits a version conflict.
    #[serde(default = "MdmRules::default_max_commit_retries")]
    pub max_commit_retries: u32,
    #[serde(flatten)]
    pub match_rules: MatchRules,
}

impl MdmRules {
    fn default_candidate_search_limit() -> usize {
        DEFAULT_CANDIDATE_SEARCH_LIMIT
    }

    fn default_max_commit_retries() -> u32 {
        3
    }

    pub fn new(mdm_types: &[&str], match_rules: MatchRules) -> Self {
        Self {
            mdm_types: mdm_types.iter().map(|t| t.to_string()).collect(),
            match_rules,
            ..Self::default()
        }
    }

    pub fn is_mdm_type(&self, resource_type: &str) -> bool {
        self.mdm_types.iter().any(|t| t == resource_type)
    }

    pub fn eid_system(&self, resource_type: &str) -> Option<&str> {
        self.eid_systems.get(resource_type).map(String::as_str)
    }

    /// FHIR default search params with `search_param_paths` applied.
    pub fn registry(&self) -> SearchParamRegistry {
        let mut registry = SearchParamRegistry::default_fhir();
        registry.extend(self.search_param_paths.clone());
        registry
    }

    /// One matcher per MDM type.
    pub fn build_matchers(&self) -> Result<BTreeMap<String, ResourceMatcher>, LinkError> {
        self.mdm_types
            .iter()
            .map(|resource_type| {
                ResourceMatcher::new(resource_type, self.match_rules.clone())
                    .map(|matcher| (resource_type.clone(), matcher))
                    .map_err(LinkError::from)
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.mdm_types.is_empty() {
            return Err(LinkError::InvalidRules("mdm_types must not be empty".into()));
        }
        if self.candidate_search_limit == 0 {
            return Err(LinkError::InvalidRules(
                "candidate_search_limit must be positive".into(),
            ));
        }
        for resource_type in self.eid_systems.keys() {
            if !self.is_mdm_type(resource_type) {
                return Err(LinkError::InvalidRules(format!(
                    "eid system configured for {resource_type}, which is not an mdm type"
                )));
            }
        }
        let registry = self.registry();
        for set in &self.candidate_search_params {
            registry.validate(set)?;
        }
        self.build_matchers()?;
        Ok(())
    }
}

impl Default for MdmRules {
    fn default() -> Self {
        Self {
            mdm_types: Vec::new(),
            candidate_search_params: Vec::new(),
            candidate_filter_params: Vec::new(),
            search_param_paths: SearchParamRegistry::new(),
            eid_systems: BTreeMap::new(),
            candidate_search_limit: Self::default_candidate_search_limit(),
            max_commit_retries: Self::default_max_commit_retries(),
            match_rules: MatchRules::default(),
        }
    }
}
