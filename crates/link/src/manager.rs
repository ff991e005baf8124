use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use candidate::{CandidateSearchCriteriaBuilder, CandidateSearcher, RecordRepository};
use chrono::Utc;
use matcher::{MatchOutcome, MatchResult, ResourceMatcher};
use record::Record;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::backend::LinkBackend;
use crate::error::LinkError;
use crate::event::{
    LinkChange, LinkChangeEvent, LinkEventEmitter, LinkEventSubscriber, LinkOperation,
    ResourceChangeMessage,
};
use crate::rules::MdmRules;
use crate::store::{LinkStore, LinkTransaction};
use crate::types::{Link, LinkMatchResult, LinkQuery, LinkSource};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOperation {
    Create,
    Update,
}

/// A created or updated record handed to the link manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange {
    pub operation: ChangeOperation,
    pub record: Record,
}

impl ResourceChange {
    pub fn create(record: Record) -> Self {
        Self {
            operation: ChangeOperation::Create,
            record,
        }
    }

    pub fn update(record: Record) -> Self {
        Self {
            operation: ChangeOperation::Update,
            record,
        }
    }
}

/// Goldens sharing an EID with the record and, when there are none, every
/// candidate with its outcome.
struct Found {
    eid_goldens: Vec<Record>,
    scored: Vec<(String, MatchOutcome)>,
}

/// Links the matching step wants to exist after an operation.
#[derive(Debug, Default)]
struct Decision {
    links: Vec<Link>,
    duplicates: Vec<Link>,
}

impl Decision {
    fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// `POSSIBLE_MATCH` to every golden plus `POSSIBLE_DUPLICATE` from the
    /// first golden to each other one.
    fn ambiguous(resource_type: &str, source_id: &str, goldens: &[(String, Option<f64>)], eid_match: bool) -> Self {
        let links = goldens
            .iter()
            .map(|(golden_id, score)| {
                Link::auto(resource_type, source_id, golden_id, LinkMatchResult::PossibleMatch)
                    .with_score(*score)
                    .with_eid_match(eid_match)
            })
            .collect();
        let duplicates = match goldens.split_first() {
            Some(((first, _), rest)) => rest
                .iter()
                .map(|(other, _)| {
                    Link::auto(resource_type, first, other, LinkMatchResult::PossibleDuplicate)
                        .with_eid_match(eid_match)
                })
                .collect(),
            None => Vec::new(),
        };
        Self { links, duplicates }
    }
}

/// Turns record changes into persisted links between source records and
/// golden records, and publishes one event per operation that changed links.
///
/// Candidate search and scoring are read-only; link writes are committed per
/// operation as one versioned batch and retried from a fresh read on
/// conflict, so a shared manager may be driven from several threads.
pub struct LinkManager {
    rules: MdmRules,
    matchers: BTreeMap<String, ResourceMatcher>,
    searcher: CandidateSearcher,
    repository: Arc<dyn RecordRepository>,
    store: LinkStore,
    emitter: LinkEventEmitter,
}

impl LinkManager {
    pub fn new(
        rules: MdmRules,
        repository: Arc<dyn RecordRepository>,
        backend: Arc<dyn LinkBackend>,
    ) -> Result<Self, LinkError> {
        rules.validate()?;
        let matchers = rules.build_matchers()?;
        let searcher = CandidateSearcher::new(
            CandidateSearchCriteriaBuilder::new(rules.registry()),
            rules.candidate_search_params.clone(),
            rules.candidate_filter_params.clone(),
            rules.candidate_search_limit,
        )?;
        info!(
            mdm_types = ?rules.mdm_types,
            match_fields = rules.match_rules.match_fields.len(),
            "link_manager_ready"
        );
        Ok(Self {
            rules,
            matchers,
            searcher,
            repository,
            store: LinkStore::new(backend),
            emitter: LinkEventEmitter::new(),
        })
    }

    pub fn rules(&self) -> &MdmRules {
        &self.rules
    }

    pub fn store(&self) -> &LinkStore {
        &self.store
    }

    pub fn repository(&self) -> &Arc<dyn RecordRepository> {
        &self.repository
    }

    pub fn emitter(&self) -> &LinkEventEmitter {
        &self.emitter
    }

    pub fn subscribe(&self, subscriber: Arc<dyn LinkEventSubscriber>) {
        self.emitter.register(subscriber);
    }

    pub fn matcher(&self, resource_type: &str) -> Option<&ResourceMatcher> {
        self.matchers.get(resource_type)
    }

    /// Save `change.record`, match it and update its links.
    ///
    /// Returns the published event, or `None` when no link changed (golden
    /// records, non-MDM types, manually linked records and reruns on
    /// unchanged data).
    pub fn handle_change(&self, change: ResourceChange) -> Result<Option<LinkChangeEvent>, LinkError> {
        let record = &change.record;
        let resource_type = record.resource_type();
        let span = info_span!(
            "mdm_link",
            resource_type,
            record_id = record.id(),
            operation = ?change.operation
        );
        let _enter = span.enter();

        if record.is_golden() {
            debug!("golden_record_skipped");
            return Ok(None);
        }
        let Some(matcher) = self.matchers.get(resource_type) else {
            debug!("non_mdm_type_skipped");
            return Ok(None);
        };

        self.repository.save(record.clone())?;
        let changes = self.relink(matcher, record)?;

        let operation = match change.operation {
            ChangeOperation::Create => LinkOperation::Create,
            ChangeOperation::Update => LinkOperation::Update,
        };
        Ok(self.publish(operation, resource_type, record.id(), changes))
    }

    /// Match `record` against the stored records and commit its links.
    fn relink(&self, matcher: &ResourceMatcher, record: &Record) -> Result<Vec<LinkChange>, LinkError> {
        let start = Instant::now();
        let mut prepared_golden: Option<Record> = None;
        let mut searched = (0, 0);
        let changes = self.with_retries(|| {
            let found = self.search(matcher, record)?;
            searched = (found.eid_goldens.len(), found.scored.len());
            self.link_once(record, &found, &mut prepared_golden)
        })?;

        // The golden is persisted only once links to it are committed, so a
        // lost race never leaves an unlinked golden behind.
        if let Some(golden) = prepared_golden {
            if changes.iter().any(|c| c.link.golden_id == golden.id()) {
                let golden_id = golden.id().to_string();
                self.repository.save(golden)?;
                info!(golden_id, "golden_record_created");
            } else {
                debug!(golden_id = golden.id(), "prepared_golden_discarded");
            }
        }

        info!(
            eid_goldens = searched.0,
            candidates = searched.1,
            changes = changes.len(),
            elapsed_micros = start.elapsed().as_micros() as u64,
            "record_linked"
        );
        Ok(changes)
    }

    /// Runs again on every attempt, so a retry sees records saved meanwhile.
    fn search(&self, matcher: &ResourceMatcher, record: &Record) -> Result<Found, LinkError> {
        let eid_goldens = match self.rules.eid_system(record.resource_type()) {
            Some(system) => self
                .searcher
                .find_goldens_by_eid(self.repository.as_ref(), record, system)?,
            None => Vec::new(),
        };
        if !eid_goldens.is_empty() {
            return Ok(Found {
                eid_goldens,
                scored: Vec::new(),
            });
        }
        let candidates = self
            .searcher
            .find_candidates(self.repository.as_ref(), record)?;
        let outcomes = matcher.match_candidates(record, &candidates)?;
        let scored = candidates
            .iter()
            .map(|c| c.id().to_string())
            .zip(outcomes)
            .collect();
        Ok(Found {
            eid_goldens,
            scored,
        })
    }

    fn link_once(
        &self,
        record: &Record,
        found: &Found,
        prepared_golden: &mut Option<Record>,
    ) -> Result<Vec<LinkChange>, LinkError> {
        let resource_type = record.resource_type();
        let source_id = record.id();
        let mut tx = self.store.begin();

        let existing = tx.links_from(resource_type, source_id)?;
        if existing.iter().any(|l| l.is_manual() && l.is_match()) {
            debug!("manual_match_kept");
            return Ok(Vec::new());
        }
        let manual: BTreeSet<String> = existing
            .iter()
            .filter(|l| l.is_manual())
            .map(|l| l.golden_id.clone())
            .collect();

        let mut decision = self.decide_by_eid(resource_type, source_id, &found.eid_goldens, &manual);
        if decision.is_empty() {
            decision = self.decide_by_score(&mut tx, record, &found.scored, &manual)?;
        }
        if decision.is_empty() {
            match existing.iter().find(|l| l.is_auto() && l.is_match()) {
                Some(current) => decision.links.push(current.clone()),
                None => {
                    let golden = match prepared_golden {
                        Some(golden) => golden.clone(),
                        None => {
                            let golden = self.repository.new_golden(record)?;
                            *prepared_golden = Some(golden.clone());
                            golden
                        }
                    };
                    decision.links.push(Link::auto(
                        resource_type,
                        source_id,
                        golden.id(),
                        LinkMatchResult::Match,
                    ));
                }
            }
        }

        let keep: BTreeSet<String> = decision.links.iter().map(|l| l.golden_id.clone()).collect();
        for link in existing.iter().filter(|l| l.is_auto()) {
            if !keep.contains(&link.golden_id) {
                tx.remove(resource_type, source_id, &link.golden_id)?;
            }
        }
        for link in decision.links {
            if !manual.contains(&link.golden_id) {
                tx.put(link)?;
            }
        }
        for duplicate in decision.duplicates {
            let reverse = tx.link(resource_type, &duplicate.golden_id, &duplicate.source_id)?;
            let forward = tx.link(resource_type, &duplicate.source_id, &duplicate.golden_id)?;
            if reverse.is_some() || forward.as_ref().is_some_and(Link::is_manual) {
                continue;
            }
            tx.put(duplicate)?;
        }

        if tx.has_changes() {
            tx.lock_source(resource_type, source_id)?;
        }
        tx.commit()
    }

    fn decide_by_eid(
        &self,
        resource_type: &str,
        source_id: &str,
        goldens: &[Record],
        manual: &BTreeSet<String>,
    ) -> Decision {
        let goldens: Vec<(String, Option<f64>)> = goldens
            .iter()
            .filter(|g| !manual.contains(g.id()))
            .map(|g| (g.id().to_string(), None))
            .collect();
        match goldens.as_slice() {
            [] => Decision::default(),
            [(golden_id, _)] => Decision {
                links: vec![
                    Link::auto(resource_type, source_id, golden_id, LinkMatchResult::Match)
                        .with_eid_match(true),
                ],
                duplicates: Vec::new(),
            },
            many => {
                debug!(goldens = many.len(), "eid_shared_by_several_goldens");
                Decision::ambiguous(resource_type, source_id, many, true)
            }
        }
    }

    /// Goldens are reached through the `MATCH` link of each scored
    /// candidate; the best outcome per golden decides.
    fn decide_by_score(
        &self,
        tx: &mut LinkTransaction<'_>,
        record: &Record,
        scored: &[(String, MatchOutcome)],
        manual: &BTreeSet<String>,
    ) -> Result<Decision, LinkError> {
        let resource_type = record.resource_type();
        let mut best: BTreeMap<String, (MatchResult, f64)> = BTreeMap::new();
        let mut consider = |golden_id: String, outcome: &MatchOutcome| {
            if manual.contains(&golden_id) {
                return;
            }
            let entry = best.entry(golden_id).or_insert((outcome.result, outcome.score));
            if (outcome.result, outcome.score) > *entry {
                *entry = (outcome.result, outcome.score);
            }
        };

        for (candidate_id, outcome) in scored {
            if !outcome.result.is_candidate() {
                continue;
            }
            match tx.matched_golden(resource_type, candidate_id)? {
                Some(golden_id) => consider(golden_id, outcome),
                // A look-alike still being linked: claim its index so the
                // two operations cannot both commit on this view.
                None => tx.lock_source(resource_type, candidate_id)?,
            }
        }

        let matched: Vec<(String, Option<f64>)> = best
            .iter()
            .filter(|(_, (result, _))| *result == MatchResult::Match)
            .map(|(id, (_, score))| (id.clone(), Some(*score)))
            .collect();
        let possible: Vec<(String, Option<f64>)> = best
            .iter()
            .filter(|(_, (result, _))| *result == MatchResult::PossibleMatch)
            .map(|(id, (_, score))| (id.clone(), Some(*score)))
            .collect();
        let source_id = record.id();

        let decision = match matched.as_slice() {
            [(golden_id, score)] => {
                let mut links = vec![Link::auto(
                    resource_type,
                    source_id,
                    golden_id,
                    LinkMatchResult::Match,
                )
                .with_score(*score)];
                links.extend(possible.iter().map(|(id, score)| {
                    Link::auto(resource_type, source_id, id, LinkMatchResult::PossibleMatch)
                        .with_score(*score)
                }));
                Decision {
                    links,
                    duplicates: Vec::new(),
                }
            }
            [] => Decision {
                links: possible
                    .iter()
                    .map(|(id, score)| {
                        Link::auto(resource_type, source_id, id, LinkMatchResult::PossibleMatch)
                            .with_score(*score)
                    })
                    .collect(),
                duplicates: Vec::new(),
            },
            _ => {
                debug!(goldens = matched.len(), "match_to_several_goldens");
                let mut decision = Decision::ambiguous(resource_type, source_id, &matched, false);
                decision.links.extend(possible.iter().map(|(id, score)| {
                    Link::auto(resource_type, source_id, id, LinkMatchResult::PossibleMatch)
                        .with_score(*score)
                }));
                decision
            }
        };
        Ok(decision)
    }

    /// Manually set the link between `source_id` and `golden_id` to `MATCH`
    /// or `NO_MATCH`. A manual `MATCH` removes the source's other `MATCH`
    /// links and its automatic links.
    ///
    /// A `NO_MATCH` that leaves a stored source record without any `MATCH`
    /// link relinks it in the same operation, skipping `golden_id`; the
    /// published event carries both sets of changes.
    pub fn update_link(
        &self,
        resource_type: &str,
        source_id: &str,
        golden_id: &str,
        result: LinkMatchResult,
    ) -> Result<Option<LinkChangeEvent>, LinkError> {
        if !matches!(result, LinkMatchResult::Match | LinkMatchResult::NoMatch) {
            return Err(LinkError::InvalidManualResult(result));
        }
        let mut changes = self.with_retries(|| {
            let mut tx = self.store.begin();
            let mut link = tx
                .link(resource_type, source_id, golden_id)?
                .ok_or_else(|| LinkError::LinkNotFound {
                    source_id: source_id.to_string(),
                    golden_id: golden_id.to_string(),
                })?;
            link.match_result = result;
            link.link_source = LinkSource::Manual;
            tx.put(link)?;

            if result == LinkMatchResult::Match {
                for other in tx.links_from(resource_type, source_id)? {
                    if other.golden_id != golden_id && (other.is_auto() || other.is_match()) {
                        tx.remove(resource_type, source_id, &other.golden_id)?;
                    }
                }
            }
            if tx.has_changes() {
                tx.lock_source(resource_type, source_id)?;
            }
            tx.commit()
        })?;
        info!(
            resource_type,
            source_id,
            golden_id,
            result = %result,
            changes = changes.len(),
            "link_updated_manually"
        );

        if result == LinkMatchResult::NoMatch && self.golden_id_for(resource_type, source_id)?.is_none() {
            let source = self
                .repository
                .get(resource_type, source_id)?
                .filter(|r| !r.is_golden());
            if let (Some(matcher), Some(source)) = (self.matchers.get(resource_type), source) {
                changes.extend(self.relink(matcher, &source)?);
            }
        }
        Ok(self.publish(LinkOperation::UpdateLink, resource_type, source_id, changes))
    }

    /// Mark two golden records flagged as possible duplicates as distinct.
    pub fn not_duplicate(
        &self,
        resource_type: &str,
        golden_a: &str,
        golden_b: &str,
    ) -> Result<Option<LinkChangeEvent>, LinkError> {
        let changes = self.with_retries(|| {
            let mut tx = self.store.begin();
            let forward = tx.link(resource_type, golden_a, golden_b)?;
            let reverse = tx.link(resource_type, golden_b, golden_a)?;
            let mut link = forward
                .into_iter()
                .chain(reverse)
                .find(|l| l.match_result == LinkMatchResult::PossibleDuplicate)
                .ok_or_else(|| LinkError::LinkNotFound {
                    source_id: golden_a.to_string(),
                    golden_id: golden_b.to_string(),
                })?;
            link.match_result = LinkMatchResult::NoMatch;
            link.link_source = LinkSource::Manual;
            tx.put(link)?;
            tx.commit()
        })?;
        info!(resource_type, golden_a, golden_b, "goldens_marked_distinct");
        Ok(self.publish(LinkOperation::NotDuplicate, resource_type, golden_a, changes))
    }

    /// Fold golden `from` into golden `to`.
    ///
    /// Every link of `from` moves to `to`; where the source already links to
    /// `to` the stronger link wins. Duplicate links between the two are
    /// dropped and `from` ends up as a manual `MATCH` source of `to`.
    pub fn merge_golden_records(
        &self,
        resource_type: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<LinkChangeEvent>, LinkError> {
        if from == to {
            return Err(LinkError::InvalidMerge(format!(
                "cannot merge golden record {from} into itself"
            )));
        }
        let from_record = self.golden_record(resource_type, from)?;
        self.golden_record(resource_type, to)?;

        let changes = self.with_retries(|| {
            let mut tx = self.store.begin();

            for link in tx.golden(resource_type, from)?.links {
                tx.remove(resource_type, &link.source_id, from)?;
                if link.source_id == to {
                    continue;
                }
                if let Some(current) = tx.link(resource_type, &link.source_id, to)? {
                    if current.strength() >= link.strength() {
                        continue;
                    }
                }
                let mut moved = link;
                moved.golden_id = to.to_string();
                moved.updated_at = Utc::now();
                tx.put(moved)?;
            }

            for link in tx.links_from(resource_type, from)? {
                tx.remove(resource_type, from, &link.golden_id)?;
                if link.golden_id == to
                    || tx.link(resource_type, to, &link.golden_id)?.is_some()
                    || tx.link(resource_type, &link.golden_id, to)?.is_some()
                {
                    continue;
                }
                let mut moved = link;
                moved.source_id = to.to_string();
                moved.updated_at = Utc::now();
                tx.put(moved)?;
            }

            tx.put(Link::new(
                resource_type,
                from,
                to,
                LinkMatchResult::Match,
                LinkSource::Manual,
            ))?;
            tx.commit()
        })?;

        // `from` is now an ordinary record redirected to `to`.
        self.repository.save(from_record.with_golden(false))?;
        info!(resource_type, from, to, changes = changes.len(), "golden_records_merged");
        Ok(self.publish(LinkOperation::MergeGoldenRecords, resource_type, from, changes))
    }

    pub fn query_links(&self, query: &LinkQuery) -> Result<Vec<Link>, LinkError> {
        self.store.query(query)
    }

    pub fn possible_duplicates(&self) -> Result<Vec<Link>, LinkError> {
        self.store
            .query(&LinkQuery::new().match_result(LinkMatchResult::PossibleDuplicate))
    }

    /// Golden record `source_id` is `MATCH`ed to.
    pub fn golden_id_for(&self, resource_type: &str, source_id: &str) -> Result<Option<String>, LinkError> {
        Ok(self
            .store
            .links_from(resource_type, source_id)?
            .into_iter()
            .find(Link::is_match)
            .map(|l| l.golden_id))
    }

    fn golden_record(&self, resource_type: &str, golden_id: &str) -> Result<Record, LinkError> {
        self.repository
            .get(resource_type, golden_id)?
            .filter(Record::is_golden)
            .ok_or_else(|| LinkError::GoldenNotFound(golden_id.to_string()))
    }

    fn with_retries<F>(&self, mut attempt: F) -> Result<Vec<LinkChange>, LinkError>
    where
        F: FnMut() -> Result<Vec<LinkChange>, LinkError>,
    {
        let mut retries = 0;
        loop {
            match attempt() {
                Err(err) if err.is_retryable() && retries < self.rules.max_commit_retries => {
                    retries += 1;
                    warn!(retries, error = %err, "link_commit_conflict");
                    std::thread::yield_now();
                }
                result => return result,
            }
        }
    }

    fn publish(
        &self,
        operation: LinkOperation,
        resource_type: &str,
        resource_id: &str,
        changes: Vec<LinkChange>,
    ) -> Option<LinkChangeEvent> {
        if changes.is_empty() {
            return None;
        }
        let event = LinkChangeEvent::new(
            ResourceChangeMessage::new(operation, resource_type, resource_id),
            changes,
        );
        self.emitter.publish(&event);
        Some(event)
    }
}
