//! Golden-record link management.
//!
//! A [`LinkManager`] receives created or updated records, finds and scores
//! candidates through the `candidate` and `matcher` crates, and maintains
//! typed links between source records and golden records:
//!
//! - `MATCH`: the source belongs to the golden record. A source has at most one.
//! - `POSSIBLE_MATCH`: the source may belong to the golden record.
//! - `POSSIBLE_DUPLICATE`: two golden records may describe the same entity.
//! - `NO_MATCH`: a manual decision that keeps the pair apart.
//!
//! Links are stored in versioned buckets behind a [`LinkBackend`]
//! (in memory or redb). Every operation commits its writes as one
//! compare-and-swap batch and is retried on conflict; every operation that
//! changed links publishes one [`LinkChangeEvent`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use candidate::InMemoryRecordRepository;
//! use link::{InMemoryLinkBackend, LinkManager, MdmRules, ResourceChange};
//! use matcher::{MatchField, MatchRules, MatcherKind};
//! use record::Record;
//!
//! let rules = MdmRules::new(
//!     &["Patient"],
//!     MatchRules {
//!         match_fields: vec![MatchField::new(
//!             "family",
//!             "Patient",
//!             "name.family",
//!             MatcherKind::String { exact: false },
//!         )],
//!         ..MatchRules::default()
//!     },
//! );
//! let manager = LinkManager::new(
//!     rules,
//!     Arc::new(InMemoryRecordRepository::new()),
//!     Arc::new(InMemoryLinkBackend::new()),
//! )?;
//! let record = Record::new("Patient", "p1").with_text("name.family", "Smith");
//! let event = manager.handle_change(ResourceChange::create(record))?;
//! assert!(event.is_some());
//! # Ok::<(), link::LinkError>(())
//! ```

mod backend;
mod error;
mod event;
mod manager;
mod rules;
mod store;
mod types;

pub use crate::backend::{
    InMemoryLinkBackend, LinkBackend, LinkBackendConfig, Versioned, VersionedWrite,
};
#[cfg(feature = "backend-redb")]
pub use crate::backend::RedbLinkBackend;
pub use crate::error::LinkError;
pub use crate::event::{
    BroadcastSubscriber, CollectingSubscriber, LinkChange, LinkChangeEvent, LinkChangeKind,
    LinkEventEmitter, LinkEventSubscriber, LinkOperation, ResourceChangeMessage, SubscriberError,
};
pub use crate::manager::{ChangeOperation, LinkManager, ResourceChange};
pub use crate::rules::MdmRules;
pub use crate::store::{GoldenLinks, LinkStore, LinkTransaction};
pub use crate::types::{Link, LinkMatchResult, LinkQuery, LinkSource};
