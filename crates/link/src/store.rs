//! Link arena.
//!
//! Links live in per-golden buckets keyed `golden:{type}/{golden_id}`. A
//! second family of entries, `source:{type}/{source_id}`, lists the goldens a
//! record is linked from so its links can be loaded without a scan. Both are
//! versioned; a [`LinkTransaction`] records the version of everything it
//! loads and commits its dirty entries as one compare-and-swap batch, with
//! the entries it only read checked in the same batch.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bincode::config::standard;
use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::backend::{LinkBackend, VersionedWrite};
use crate::error::LinkError;
use crate::event::{LinkChange, LinkChangeKind};
use crate::types::{Link, LinkQuery};

const GOLDEN_PREFIX: &str = "golden:";
const SOURCE_PREFIX: &str = "source:";

fn golden_key(resource_type: &str, golden_id: &str) -> String {
    format!("{GOLDEN_PREFIX}{resource_type}/{golden_id}")
}

fn source_key(resource_type: &str, source_id: &str) -> String {
    format!("{SOURCE_PREFIX}{resource_type}/{source_id}")
}

/// Every link pointing at one golden record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenLinks {
    pub golden_id: String,
    /// Backend version this bucket was read at; `0` when new.
    #[serde(skip)]
    pub version: u64,
    pub links: Vec<Link>,
}

impl GoldenLinks {
    fn empty(golden_id: &str) -> Self {
        Self {
            golden_id: golden_id.to_string(),
            version: 0,
            links: Vec::new(),
        }
    }

    pub fn link_from(&self, source_id: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.source_id == source_id)
    }
}

/// Goldens a record has links to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SourceIndex {
    source_id: String,
    #[serde(skip)]
    version: u64,
    golden_ids: BTreeSet<String>,
}

impl SourceIndex {
    fn empty(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            version: 0,
            golden_ids: BTreeSet::new(),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LinkError> {
    Ok(encode_to_vec(value, standard())?)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LinkError> {
    let (value, _) = decode_from_slice(bytes, standard())?;
    Ok(value)
}

/// Typed access to links over a [`LinkBackend`].
#[derive(Clone)]
pub struct LinkStore {
    backend: Arc<dyn LinkBackend>,
}

impl LinkStore {
    pub fn new(backend: Arc<dyn LinkBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn LinkBackend> {
        &self.backend
    }

    /// The bucket of `golden_id`, empty at version `0` when absent.
    pub fn golden_links(&self, resource_type: &str, golden_id: &str) -> Result<GoldenLinks, LinkError> {
        match self.backend.get(&golden_key(resource_type, golden_id))? {
            Some(entry) => {
                let mut bucket: GoldenLinks = decode(&entry.value)?;
                bucket.version = entry.version;
                Ok(bucket)
            }
            None => Ok(GoldenLinks::empty(golden_id)),
        }
    }

    fn source_index(&self, resource_type: &str, source_id: &str) -> Result<SourceIndex, LinkError> {
        match self.backend.get(&source_key(resource_type, source_id))? {
            Some(entry) => {
                let mut index: SourceIndex = decode(&entry.value)?;
                index.version = entry.version;
                Ok(index)
            }
            None => Ok(SourceIndex::empty(source_id)),
        }
    }

    /// Links whose source is `source_id`, ordered by golden id.
    pub fn links_from(&self, resource_type: &str, source_id: &str) -> Result<Vec<Link>, LinkError> {
        let index = self.source_index(resource_type, source_id)?;
        let mut links = Vec::new();
        for golden_id in &index.golden_ids {
            let bucket = self.golden_links(resource_type, golden_id)?;
            links.extend(bucket.link_from(source_id).cloned());
        }
        Ok(links)
    }

    /// Every stored link accepted by `query`, ordered by golden then source id.
    pub fn query(&self, query: &LinkQuery) -> Result<Vec<Link>, LinkError> {
        let prefix = match &query.resource_type {
            Some(resource_type) => format!("{GOLDEN_PREFIX}{resource_type}/"),
            None => GOLDEN_PREFIX.to_string(),
        };
        let mut links = Vec::new();
        self.backend.scan_prefix(&prefix, &mut |_, entry| {
            let bucket: GoldenLinks = decode(&entry.value)?;
            links.extend(bucket.links.into_iter().filter(|l| query.matches(l)));
            Ok(())
        })?;
        links.sort_by(|a, b| {
            (&a.resource_type, &a.golden_id, &a.source_id).cmp(&(&b.resource_type, &b.golden_id, &b.source_id))
        });
        Ok(links)
    }

    pub fn begin(&self) -> LinkTransaction<'_> {
        LinkTransaction {
            store: self,
            goldens: BTreeMap::new(),
            sources: BTreeMap::new(),
            dirty: BTreeSet::new(),
            changes: Vec::new(),
        }
    }
}

/// Unit of work over the link arena.
///
/// Reads are cached so the transaction sees its own writes. Nothing reaches
/// the backend until [`commit`](Self::commit).
pub struct LinkTransaction<'s> {
    store: &'s LinkStore,
    goldens: BTreeMap<String, GoldenLinks>,
    sources: BTreeMap<String, SourceIndex>,
    dirty: BTreeSet<String>,
    changes: Vec<LinkChange>,
}

impl LinkTransaction<'_> {
    fn golden_mut(&mut self, resource_type: &str, golden_id: &str) -> Result<&mut GoldenLinks, LinkError> {
        let key = golden_key(resource_type, golden_id);
        if !self.goldens.contains_key(&key) {
            let bucket = self.store.golden_links(resource_type, golden_id)?;
            self.goldens.insert(key.clone(), bucket);
        }
        self.goldens
            .get_mut(&key)
            .ok_or_else(|| LinkError::backend("golden bucket vanished from transaction cache"))
    }

    fn source_mut(&mut self, resource_type: &str, source_id: &str) -> Result<&mut SourceIndex, LinkError> {
        let key = source_key(resource_type, source_id);
        if !self.sources.contains_key(&key) {
            let index = self.store.source_index(resource_type, source_id)?;
            self.sources.insert(key.clone(), index);
        }
        self.sources
            .get_mut(&key)
            .ok_or_else(|| LinkError::backend("source index vanished from transaction cache"))
    }

    /// Snapshot of every link of `golden_id`.
    pub fn golden(&mut self, resource_type: &str, golden_id: &str) -> Result<GoldenLinks, LinkError> {
        Ok(self.golden_mut(resource_type, golden_id)?.clone())
    }

    /// Links whose source is `source_id`, ordered by golden id.
    pub fn links_from(&mut self, resource_type: &str, source_id: &str) -> Result<Vec<Link>, LinkError> {
        let golden_ids: Vec<String> = self
            .source_mut(resource_type, source_id)?
            .golden_ids
            .iter()
            .cloned()
            .collect();
        let mut links = Vec::with_capacity(golden_ids.len());
        for golden_id in golden_ids {
            if let Some(link) = self.golden_mut(resource_type, &golden_id)?.link_from(source_id) {
                links.push(link.clone());
            }
        }
        Ok(links)
    }

    pub fn link(&mut self, resource_type: &str, source_id: &str, golden_id: &str) -> Result<Option<Link>, LinkError> {
        Ok(self
            .golden_mut(resource_type, golden_id)?
            .link_from(source_id)
            .cloned())
    }

    /// Golden `source_id` is currently `MATCH`ed to, if any.
    pub fn matched_golden(&mut self, resource_type: &str, source_id: &str) -> Result<Option<String>, LinkError> {
        Ok(self
            .links_from(resource_type, source_id)?
            .into_iter()
            .find(Link::is_match)
            .map(|l| l.golden_id))
    }

    /// Insert `link` or update the stored link for the same pair.
    ///
    /// An existing link with the same decision is left untouched and `None`
    /// is returned.
    pub fn put(&mut self, mut link: Link) -> Result<Option<LinkChangeKind>, LinkError> {
        let resource_type = link.resource_type.clone();
        let key = golden_key(&resource_type, &link.golden_id);
        let bucket = self.golden_mut(&resource_type, &link.golden_id)?;

        let kind = match bucket.links.iter_mut().find(|l| l.source_id == link.source_id) {
            Some(existing) if existing.same_decision(&link) => return Ok(None),
            Some(existing) => {
                link.version = existing.version + 1;
                link.created_at = existing.created_at;
                link.updated_at = Utc::now();
                *existing = link.clone();
                LinkChangeKind::Updated
            }
            None => {
                bucket.links.push(link.clone());
                LinkChangeKind::Created
            }
        };
        self.dirty.insert(key);

        let source = self.source_mut(&resource_type, &link.source_id)?;
        if source.golden_ids.insert(link.golden_id.clone()) {
            self.dirty.insert(source_key(&resource_type, &link.source_id));
        }

        trace!(link = %link, kind = ?kind, "link_staged");
        self.changes.push(LinkChange { kind, link });
        Ok(Some(kind))
    }

    /// Remove the link from `source_id` to `golden_id`, returning it.
    pub fn remove(&mut self, resource_type: &str, source_id: &str, golden_id: &str) -> Result<Option<Link>, LinkError> {
        let bucket = self.golden_mut(resource_type, golden_id)?;
        let Some(position) = bucket.links.iter().position(|l| l.source_id == source_id) else {
            return Ok(None);
        };
        let removed = bucket.links.remove(position);
        self.dirty.insert(golden_key(resource_type, golden_id));

        let source = self.source_mut(resource_type, source_id)?;
        if source.golden_ids.remove(golden_id) {
            self.dirty.insert(source_key(resource_type, source_id));
        }

        trace!(link = %removed, "link_removal_staged");
        self.changes.push(LinkChange {
            kind: LinkChangeKind::Removed,
            link: removed.clone(),
        });
        Ok(Some(removed))
    }

    /// Include the source index of `source_id` in the commit even if its
    /// golden set did not change, so concurrent operations on the same record
    /// conflict.
    pub fn lock_source(&mut self, resource_type: &str, source_id: &str) -> Result<(), LinkError> {
        self.source_mut(resource_type, source_id)?;
        self.dirty.insert(source_key(resource_type, source_id));
        Ok(())
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Write every dirty entry in one batch and return the staged changes.
    /// Entries that were read but not changed go along as version checks, so
    /// a decision taken on a stale read fails with a version conflict.
    /// A transaction without changes writes nothing.
    pub fn commit(self) -> Result<Vec<LinkChange>, LinkError> {
        if self.changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut writes = Vec::with_capacity(self.goldens.len() + self.sources.len());
        for (key, bucket) in &self.goldens {
            writes.push(if self.dirty.contains(key) {
                VersionedWrite::put(key.as_str(), bucket.version, encode(bucket)?)
            } else {
                VersionedWrite::check(key.as_str(), bucket.version)
            });
        }
        for (key, index) in &self.sources {
            writes.push(if self.dirty.contains(key) {
                VersionedWrite::put(key.as_str(), index.version, encode(index)?)
            } else {
                VersionedWrite::check(key.as_str(), index.version)
            });
        }
        trace!(
            entries = writes.len(),
            dirty = self.dirty.len(),
            changes = self.changes.len(),
            "link_commit"
        );
        self.store.backend.commit(writes)?;
        Ok(self.changes)
    }
}
