//! Workspace umbrella crate for the MDM record-linkage core.
//!
//! This crate stitches the record model, field and resource matching,
//! candidate search and golden-record linking together behind a single
//! [`Mdm`] entry point configured from YAML.
//!
//! ```no_run
//! use mdm::{Mdm, MdmConfig};
//! use serde_json::json;
//!
//! let config = MdmConfig::from_file("mdm.yaml")?;
//! let mdm = Mdm::from_config(config)?;
//! let resource = json!({
//!     "resourceType": "Patient",
//!     "id": "p1",
//!     "name": [{ "given": ["Jose"], "family": "Fernandez" }]
//! });
//! if let Some(event) = mdm.submit_json(&resource)? {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod logging;

pub use candidate::{
    CandidateError, CandidateFilterParam, CandidateQuery, CandidateSearchCriteriaBuilder,
    CandidateSearchParam, CandidateSearcher, InMemoryRecordRepository, RecordRepository,
    RepositoryError, SearchParamRegistry,
};
pub use config::{ConfigLoadError, LoggingConfig, MdmConfig};
pub use link::{
    BroadcastSubscriber, ChangeOperation, CollectingSubscriber, InMemoryLinkBackend, Link,
    LinkBackend, LinkBackendConfig, LinkChange, LinkChangeEvent, LinkChangeKind, LinkError,
    LinkEventSubscriber, LinkManager, LinkMatchResult, LinkOperation, LinkQuery, LinkSource,
    LinkStore, MdmRules, ResourceChange, ResourceChangeMessage, SubscriberError,
};
#[cfg(feature = "backend-redb")]
pub use link::RedbLinkBackend;
pub use logging::{init_tracing, LoggingGuard};
pub use matcher::{
    FieldMatcher, MatchError, MatchField, MatchOutcome, MatchResult, MatchRules, MatcherKind,
    ResourceMatcher, SimilarityMetric,
};
pub use record::{FieldValue, Record, RecordError};

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

/// Errors surfaced by the umbrella API.
#[derive(Debug, Error)]
pub enum MdmError {
    #[error(transparent)]
    Config(#[from] ConfigLoadError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("logging setup failed: {0}")]
    Logging(String),
}

/// A configured MDM instance: repository, link storage and link manager.
pub struct Mdm {
    config: MdmConfig,
    repository: Arc<dyn RecordRepository>,
    manager: LinkManager,
}

impl Mdm {
    /// Build an instance over an in-memory record repository.
    pub fn from_config(config: MdmConfig) -> Result<Self, MdmError> {
        let repository = Arc::new(InMemoryRecordRepository::with_registry(
            config.rules.registry(),
        ));
        Self::with_repository(config, repository)
    }

    /// Build an instance over a caller-provided record repository.
    pub fn with_repository(
        config: MdmConfig,
        repository: Arc<dyn RecordRepository>,
    ) -> Result<Self, MdmError> {
        config.validate()?;
        let backend = config.storage.build()?;
        let manager = LinkManager::new(config.rules.clone(), repository.clone(), backend)?;
        info!(
            name = config.name.as_deref().unwrap_or("unnamed"),
            storage = ?config.storage,
            "mdm_ready"
        );
        Ok(Self {
            config,
            repository,
            manager,
        })
    }

    pub fn config(&self) -> &MdmConfig {
        &self.config
    }

    pub fn manager(&self) -> &LinkManager {
        &self.manager
    }

    pub fn repository(&self) -> &Arc<dyn RecordRepository> {
        &self.repository
    }

    pub fn subscribe(&self, subscriber: Arc<dyn LinkEventSubscriber>) {
        self.manager.subscribe(subscriber);
    }

    /// Link `record`: a create when its id is new to the repository, an
    /// update otherwise.
    pub fn submit(&self, record: Record) -> Result<Option<LinkChangeEvent>, MdmError> {
        let known = self
            .repository
            .get(record.resource_type(), record.id())?
            .is_some();
        let change = if known {
            ResourceChange::update(record)
        } else {
            ResourceChange::create(record)
        };
        Ok(self.manager.handle_change(change)?)
    }

    /// Flatten a JSON resource and [`submit`](Self::submit) it.
    pub fn submit_json(&self, resource: &JsonValue) -> Result<Option<LinkChangeEvent>, MdmError> {
        self.submit(Record::from_json(resource)?)
    }
}
