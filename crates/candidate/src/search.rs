//! Record storage seam and candidate retrieval.
use std::collections::BTreeMap;
use std::sync::RwLock;

use record::Record;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::criteria::CandidateSearchCriteriaBuilder;
use crate::error::{CandidateError, RepositoryError};
use crate::params::{filter_fragments, CandidateFilterParam, CandidateSearchParam};
use crate::query::CandidateQuery;
use crate::SearchParamRegistry;

/// Default cap on the number of candidates a single record may pull.
pub const DEFAULT_CANDIDATE_SEARCH_LIMIT: usize = 1000;

/// Storage the MDM core reads records from and creates golden records in.
pub trait RecordRepository: Send + Sync {
    /// Records satisfying `query`, in a stable order.
    fn search(&self, query: &CandidateQuery) -> Result<Vec<Record>, RepositoryError>;

    fn get(&self, resource_type: &str, id: &str) -> Result<Option<Record>, RepositoryError>;

    /// Insert or replace a record.
    fn save(&self, record: Record) -> Result<(), RepositoryError>;

    /// A golden record seeded from `source` under a fresh id. Nothing is
    /// persisted until the record is passed to [`save`](Self::save).
    fn new_golden(&self, source: &Record) -> Result<Record, RepositoryError>;

    /// Persist a new golden record seeded from `source` and return it.
    fn create_golden(&self, source: &Record) -> Result<Record, RepositoryError> {
        let golden = self.new_golden(source)?;
        self.save(golden.clone())?;
        Ok(golden)
    }
}

/// `RwLock<BTreeMap>` repository for embedding and tests.
pub struct InMemoryRecordRepository {
    registry: SearchParamRegistry,
    records: RwLock<BTreeMap<(String, String), Record>>,
}

impl InMemoryRecordRepository {
    pub fn new() -> Self {
        Self::with_registry(SearchParamRegistry::default_fhir())
    }

    /// Repository that evaluates queries with a custom registry.
    pub fn with_registry(registry: SearchParamRegistry) -> Self {
        Self {
            registry,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Golden records of `resource_type`, ordered by id.
    pub fn goldens(&self, resource_type: &str) -> Result<Vec<Record>, RepositoryError> {
        let guard = self
            .records
            .read()
            .map_err(|_| RepositoryError::backend("poisoned lock"))?;
        Ok(guard
            .values()
            .filter(|r| r.resource_type() == resource_type && r.is_golden())
            .cloned()
            .collect())
    }
}

impl Default for InMemoryRecordRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordRepository for InMemoryRecordRepository {
    fn search(&self, query: &CandidateQuery) -> Result<Vec<Record>, RepositoryError> {
        let guard = self
            .records
            .read()
            .map_err(|_| RepositoryError::backend("poisoned lock"))?;
        let mut found = Vec::new();
        for record in guard.values() {
            if query
                .matches(record, &self.registry)
                .map_err(RepositoryError::backend)?
            {
                found.push(record.clone());
            }
        }
        Ok(found)
    }

    fn get(&self, resource_type: &str, id: &str) -> Result<Option<Record>, RepositoryError> {
        let guard = self
            .records
            .read()
            .map_err(|_| RepositoryError::backend("poisoned lock"))?;
        Ok(guard
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned())
    }

    fn save(&self, record: Record) -> Result<(), RepositoryError> {
        let key = (record.resource_type().to_string(), record.id().to_string());
        self.records
            .write()
            .map_err(|_| RepositoryError::backend("poisoned lock"))?
            .insert(key, record);
        Ok(())
    }

    fn new_golden(&self, source: &Record) -> Result<Record, RepositoryError> {
        let golden = source.to_golden(Uuid::new_v4().to_string());
        debug!(
            resource_type = source.resource_type(),
            record_id = source.id(),
            golden_id = golden.id(),
            "golden_record_prepared"
        );
        Ok(golden)
    }
}

/// Runs the configured candidate queries for a record against a repository.
#[derive(Debug, Clone)]
pub struct CandidateSearcher {
    builder: CandidateSearchCriteriaBuilder,
    search_params: Vec<CandidateSearchParam>,
    filter_params: Vec<CandidateFilterParam>,
    limit: usize,
}

impl CandidateSearcher {
    /// Fails when a configured search param is unknown to the builder's
    /// registry.
    pub fn new(
        builder: CandidateSearchCriteriaBuilder,
        search_params: Vec<CandidateSearchParam>,
        filter_params: Vec<CandidateFilterParam>,
        limit: usize,
    ) -> Result<Self, CandidateError> {
        for set in &search_params {
            builder.registry().validate(set)?;
        }
        Ok(Self {
            builder,
            search_params,
            filter_params,
            limit,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Query strings for `record`: one per configured param set of its type,
    /// or a single unconstrained query when none is configured.
    pub fn queries_for(&self, record: &Record) -> Result<Vec<String>, CandidateError> {
        let resource_type = record.resource_type();
        let filters = filter_fragments(&self.filter_params, resource_type);
        let sets: Vec<&CandidateSearchParam> = self
            .search_params
            .iter()
            .filter(|set| set.resource_type == resource_type)
            .collect();

        if sets.is_empty() {
            return Ok(self
                .builder
                .build_resource_query_string(resource_type, record, &filters, None)?
                .into_iter()
                .collect());
        }

        let mut queries = Vec::with_capacity(sets.len());
        for set in sets {
            if let Some(query) =
                self.builder
                    .build_resource_query_string(resource_type, record, &filters, Some(set))?
            {
                if !queries.contains(&query) {
                    queries.push(query);
                }
            }
        }
        Ok(queries)
    }

    /// Non-golden records that may describe the same entity as `record`,
    /// ordered by id. `record` itself is excluded.
    pub fn find_candidates(
        &self,
        repository: &dyn RecordRepository,
        record: &Record,
    ) -> Result<Vec<Record>, CandidateError> {
        let queries = self.queries_for(record)?;
        let mut candidates: BTreeMap<String, Record> = BTreeMap::new();
        for query in &queries {
            let parsed = CandidateQuery::parse(query)?;
            for found in repository.search(&parsed)? {
                if found.is_golden() || found.id() == record.id() {
                    continue;
                }
                candidates.entry(found.id().to_string()).or_insert(found);
            }
        }

        if candidates.len() > self.limit {
            warn!(
                resource_type = record.resource_type(),
                record_id = record.id(),
                found = candidates.len(),
                limit = self.limit,
                "candidate_limit_exceeded"
            );
            return Err(CandidateError::TooManyCandidates {
                resource_type: record.resource_type().to_string(),
                found: candidates.len(),
                limit: self.limit,
            });
        }

        debug!(
            resource_type = record.resource_type(),
            record_id = record.id(),
            queries = queries.len(),
            candidates = candidates.len(),
            "candidates_found"
        );
        Ok(candidates.into_values().collect())
    }

    /// Golden records sharing an enterprise identifier of `system` with
    /// `record`, ordered by id.
    pub fn find_goldens_by_eid(
        &self,
        repository: &dyn RecordRepository,
        record: &Record,
        system: &str,
    ) -> Result<Vec<Record>, CandidateError> {
        let eids = record.identifiers_in(system);
        if eids.is_empty() {
            return Ok(Vec::new());
        }
        let query = CandidateQuery::new(record.resource_type()).with_condition(
            "identifier",
            eids.iter().map(|eid| format!("{system}|{eid}")),
        );
        let mut goldens: Vec<Record> = repository
            .search(&query)?
            .into_iter()
            .filter(Record::is_golden)
            .collect();
        goldens.sort_by(|a, b| a.id().cmp(b.id()));
        goldens.dedup_by(|a, b| a.id() == b.id());
        Ok(goldens)
    }
}
