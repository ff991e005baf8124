use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use candidate::{CandidateQuery, InMemoryRecordRepository, RepositoryError};
use matcher::{MatchField, MatchRules, MatcherKind, SimilarityMetric};

use crate::backend::{InMemoryLinkBackend, Versioned, VersionedWrite};
use crate::event::{CollectingSubscriber, LinkChangeKind};

const EID_SYSTEM: &str = "urn:mdm:eid";

fn rules() -> MdmRules {
    let match_rules = MatchRules {
        match_fields: vec![
            MatchField::new(
                "given",
                "Patient",
                "name.given",
                MatcherKind::Similarity {
                    metric: SimilarityMetric::JaroWinkler,
                    match_threshold: 0.85,
                },
            ),
            MatchField::new(
                "family",
                "Patient",
                "name.family",
                MatcherKind::String { exact: false },
            ),
            MatchField::new("birthdate", "Patient", "birthDate", MatcherKind::Date),
        ],
        ..MatchRules::default()
    };
    let mut rules = MdmRules::new(&["Patient"], match_rules);
    rules
        .eid_systems
        .insert("Patient".to_string(), EID_SYSTEM.to_string());
    rules
}

fn patient(id: &str, given: &str, family: &str, birth: &str) -> Record {
    Record::new("Patient", id)
        .with_text("name.given", given)
        .with_text("name.family", family)
        .with_text("birthDate", birth)
}

struct Fixture {
    manager: LinkManager,
    repository: Arc<InMemoryRecordRepository>,
    events: Arc<CollectingSubscriber>,
}

fn fixture_with(rules: MdmRules, backend: Arc<dyn LinkBackend>) -> Fixture {
    let repository = Arc::new(InMemoryRecordRepository::new());
    let manager = LinkManager::new(rules, repository.clone(), backend).unwrap();
    let events = Arc::new(CollectingSubscriber::new());
    manager.subscribe(events.clone());
    Fixture {
        manager,
        repository,
        events,
    }
}

fn fixture() -> Fixture {
    fixture_with(rules(), Arc::new(InMemoryLinkBackend::new()))
}

fn create(fx: &Fixture, record: Record) -> Option<LinkChangeEvent> {
    fx.manager.handle_change(ResourceChange::create(record)).unwrap()
}

fn golden_of(fx: &Fixture, source_id: &str) -> String {
    fx.manager
        .golden_id_for("Patient", source_id)
        .unwrap()
        .unwrap()
}

fn links_of(fx: &Fixture, source_id: &str) -> Vec<Link> {
    fx.manager
        .query_links(&LinkQuery::new().resource_type("Patient").source_id(source_id))
        .unwrap()
}

#[test]
fn first_record_gets_a_new_golden() {
    let fx = fixture();
    let event = create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12")).unwrap();

    assert_eq!(event.message.operation, LinkOperation::Create);
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].kind, LinkChangeKind::Created);
    let link = &event.changes[0].link;
    assert!(link.is_match() && link.is_auto());

    let goldens = fx.repository.goldens("Patient").unwrap();
    assert_eq!(goldens.len(), 1);
    assert_eq!(goldens[0].id(), link.golden_id);
    assert_eq!(fx.events.len(), 1);
}

#[test]
fn matching_record_joins_the_existing_golden() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    let event = create(&fx, patient("p2", "Jose", "Fernandez", "1980-04-12")).unwrap();

    assert_eq!(golden_of(&fx, "p2"), golden_of(&fx, "p1"));
    assert_eq!(fx.repository.goldens("Patient").unwrap().len(), 1);
    assert_eq!(event.changes[0].link.score, Some(1.0));
}

#[test]
fn possible_match_is_linked_without_a_new_golden() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    create(&fx, patient("p2", "Jose", "Fernandez", "1991-01-30"));

    let links = links_of(&fx, "p2");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].match_result, LinkMatchResult::PossibleMatch);
    assert_eq!(links[0].golden_id, golden_of(&fx, "p1"));
    assert_eq!(fx.repository.goldens("Patient").unwrap().len(), 1);
}

#[test]
fn shared_eids_produce_possible_matches_and_duplicates() {
    let fx = fixture();
    create(
        &fx,
        patient("p1", "John", "Smith", "1970-01-01").with_identifier(Some(EID_SYSTEM), "eid-11"),
    );
    create(
        &fx,
        patient("p2", "Jane", "Doe", "1985-06-15").with_identifier(Some(EID_SYSTEM), "eid-22"),
    );
    let g1 = golden_of(&fx, "p1");
    let g2 = golden_of(&fx, "p2");
    assert_ne!(g1, g2);

    let event = create(
        &fx,
        patient("p3", "Bob", "Brown", "1990-02-02").with_identifier(Some(EID_SYSTEM), "eid-22"),
    )
    .unwrap();
    assert!(event.changes[0].link.eid_match);
    assert_eq!(golden_of(&fx, "p3"), g2);

    let updated = patient("p3", "Bob", "Brown", "1990-02-02")
        .with_identifier(Some(EID_SYSTEM), "eid-11")
        .with_identifier(Some(EID_SYSTEM), "eid-22");
    let event = fx
        .manager
        .handle_change(ResourceChange::update(updated.clone()))
        .unwrap()
        .unwrap();
    assert_eq!(event.message.operation, LinkOperation::Update);
    assert_eq!(event.count_result(LinkMatchResult::PossibleMatch), 2);
    assert_eq!(event.count_result(LinkMatchResult::PossibleDuplicate), 1);

    let links = links_of(&fx, "p3");
    assert_eq!(links.len(), 2);
    assert!(links
        .iter()
        .all(|l| l.match_result == LinkMatchResult::PossibleMatch));

    let duplicates = fx.manager.possible_duplicates().unwrap();
    assert_eq!(duplicates.len(), 1);
    assert!(duplicates[0].connects(&g1, &g2));

    // Same data again: nothing changes and nothing is published.
    let before = fx.events.len();
    assert!(fx
        .manager
        .handle_change(ResourceChange::update(updated))
        .unwrap()
        .is_none());
    assert_eq!(fx.events.len(), before);
}

#[test]
fn reprocessing_unchanged_record_is_a_no_op() {
    let fx = fixture();
    let record = patient("p1", "Jose", "Fernandez", "1980-04-12");
    create(&fx, record.clone());
    let version = links_of(&fx, "p1")[0].version;

    assert!(fx
        .manager
        .handle_change(ResourceChange::update(record))
        .unwrap()
        .is_none());
    assert_eq!(links_of(&fx, "p1")[0].version, version);
    assert_eq!(fx.repository.goldens("Patient").unwrap().len(), 1);
}

#[test]
fn golden_and_non_mdm_records_are_ignored() {
    let fx = fixture();
    let golden = patient("g-external", "Ana", "Lopez", "1970-01-01").with_golden(true);
    assert!(create(&fx, golden).is_none());
    let practitioner = Record::new("Practitioner", "d1").with_text("name.family", "House");
    assert!(create(&fx, practitioner).is_none());
    assert!(fx.manager.query_links(&LinkQuery::new()).unwrap().is_empty());
    assert!(fx.events.is_empty());
}

#[test]
fn stale_automatic_links_are_removed() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    create(&fx, patient("p2", "Jose", "Fernandez", "1991-01-30"));
    let g1 = golden_of(&fx, "p1");

    let event = fx
        .manager
        .handle_change(ResourceChange::update(patient("p2", "Zed", "Quux", "2001-09-09")))
        .unwrap()
        .unwrap();
    assert_eq!(event.changes_of(LinkChangeKind::Removed).count(), 1);
    assert_eq!(event.changes_of(LinkChangeKind::Created).count(), 1);

    let links = links_of(&fx, "p2");
    assert_eq!(links.len(), 1);
    assert!(links[0].is_match());
    assert_ne!(links[0].golden_id, g1);
}

#[test]
fn manual_match_wins_over_automatic_linking() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    create(&fx, patient("p2", "Jose", "Fernandez", "1991-01-30"));
    let g1 = golden_of(&fx, "p1");

    let event = fx
        .manager
        .update_link("Patient", "p2", &g1, LinkMatchResult::Match)
        .unwrap()
        .unwrap();
    assert_eq!(event.message.operation, LinkOperation::UpdateLink);
    let link = &links_of(&fx, "p2")[0];
    assert!(link.is_manual() && link.is_match());

    let moved = patient("p2", "Zed", "Quux", "2001-09-09");
    assert!(fx
        .manager
        .handle_change(ResourceChange::update(moved))
        .unwrap()
        .is_none());
    assert_eq!(golden_of(&fx, "p2"), g1);
}

#[test]
fn manual_no_match_keeps_golden_out_of_reach() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    create(&fx, patient("p2", "Jose", "Fernandez", "1991-01-30"));
    let g1 = golden_of(&fx, "p1");

    fx.manager
        .update_link("Patient", "p2", &g1, LinkMatchResult::NoMatch)
        .unwrap();
    fx.manager
        .handle_change(ResourceChange::update(patient("p2", "Jose", "Fernandez", "1991-01-30")))
        .unwrap();

    let links = links_of(&fx, "p2");
    assert_eq!(links.len(), 2);
    let rejected = links.iter().find(|l| l.golden_id == g1).unwrap();
    assert_eq!(rejected.match_result, LinkMatchResult::NoMatch);
    assert!(rejected.is_manual());
    assert_ne!(golden_of(&fx, "p2"), g1);
}

#[test]
fn update_link_rejects_bad_input() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    let g1 = golden_of(&fx, "p1");

    let err = fx
        .manager
        .update_link("Patient", "p1", &g1, LinkMatchResult::PossibleMatch)
        .unwrap_err();
    assert!(matches!(
        err,
        LinkError::InvalidManualResult(LinkMatchResult::PossibleMatch)
    ));
    let err = fx
        .manager
        .update_link("Patient", "p9", &g1, LinkMatchResult::Match)
        .unwrap_err();
    assert!(matches!(err, LinkError::LinkNotFound { .. }));
}

#[test]
fn not_duplicate_is_remembered() {
    let fx = fixture();
    create(
        &fx,
        patient("p1", "John", "Smith", "1970-01-01").with_identifier(Some(EID_SYSTEM), "eid-11"),
    );
    create(
        &fx,
        patient("p2", "Jane", "Doe", "1985-06-15").with_identifier(Some(EID_SYSTEM), "eid-22"),
    );
    let both = patient("p3", "Bob", "Brown", "1990-02-02")
        .with_identifier(Some(EID_SYSTEM), "eid-11")
        .with_identifier(Some(EID_SYSTEM), "eid-22");
    create(&fx, both.clone());
    let g1 = golden_of(&fx, "p1");
    let g2 = golden_of(&fx, "p2");

    // Argument order does not matter.
    let event = fx
        .manager
        .not_duplicate("Patient", &g2, &g1)
        .unwrap()
        .unwrap();
    assert_eq!(event.message.operation, LinkOperation::NotDuplicate);
    assert!(fx.manager.possible_duplicates().unwrap().is_empty());

    assert!(fx
        .manager
        .handle_change(ResourceChange::update(both))
        .unwrap()
        .is_none());
    assert!(fx.manager.possible_duplicates().unwrap().is_empty());

    let err = fx.manager.not_duplicate("Patient", &g1, &g2).unwrap_err();
    assert!(matches!(err, LinkError::LinkNotFound { .. }));
}

#[test]
fn merge_moves_links_onto_the_surviving_golden() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    create(&fx, patient("p2", "Bob", "Brown", "1990-02-02"));
    let g1 = golden_of(&fx, "p1");
    let g2 = golden_of(&fx, "p2");

    let event = fx
        .manager
        .merge_golden_records("Patient", &g2, &g1)
        .unwrap()
        .unwrap();
    assert_eq!(event.message.operation, LinkOperation::MergeGoldenRecords);

    assert_eq!(golden_of(&fx, "p2"), g1);
    let redirect = &links_of(&fx, &g2)[0];
    assert_eq!(redirect.golden_id, g1);
    assert!(redirect.is_manual() && redirect.is_match());
    assert!(fx
        .manager
        .store()
        .golden_links("Patient", &g2)
        .unwrap()
        .links
        .is_empty());

    let retired = fx.repository.get("Patient", &g2).unwrap().unwrap();
    assert!(!retired.is_golden());
    assert_eq!(fx.repository.goldens("Patient").unwrap().len(), 1);
}

#[test]
fn merge_keeps_the_stronger_link() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    create(&fx, patient("p2", "Jose", "Fernandez", "1991-01-30"));
    let g1 = golden_of(&fx, "p1");
    // p2 is a possible match of g1; give it a golden of its own as well.
    fx.manager
        .update_link("Patient", "p2", &g1, LinkMatchResult::NoMatch)
        .unwrap();
    fx.manager
        .handle_change(ResourceChange::update(patient("p2", "Jose", "Fernandez", "1991-01-30")))
        .unwrap();
    let g2 = golden_of(&fx, "p2");

    fx.manager.merge_golden_records("Patient", &g2, &g1).unwrap();

    // Auto MATCH (rank 3) beats the manual NO_MATCH already stored on g1.
    let link = fx
        .manager
        .store()
        .golden_links("Patient", &g1)
        .unwrap()
        .link_from("p2")
        .cloned()
        .unwrap();
    assert!(link.is_match());
}

#[test]
fn merge_rejects_self_and_unknown_goldens() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    let g1 = golden_of(&fx, "p1");

    assert!(matches!(
        fx.manager.merge_golden_records("Patient", &g1, &g1),
        Err(LinkError::InvalidMerge(_))
    ));
    assert!(matches!(
        fx.manager.merge_golden_records("Patient", "missing", &g1),
        Err(LinkError::GoldenNotFound(id)) if id == "missing"
    ));
    assert!(matches!(
        fx.manager.merge_golden_records("Patient", "p1", &g1),
        Err(LinkError::GoldenNotFound(_))
    ));
}

struct NoGoldens(InMemoryRecordRepository);

impl RecordRepository for NoGoldens {
    fn search(&self, query: &CandidateQuery) -> Result<Vec<Record>, RepositoryError> {
        self.0.search(query)
    }

    fn get(&self, resource_type: &str, id: &str) -> Result<Option<Record>, RepositoryError> {
        self.0.get(resource_type, id)
    }

    fn save(&self, record: Record) -> Result<(), RepositoryError> {
        self.0.save(record)
    }

    fn new_golden(&self, _source: &Record) -> Result<Record, RepositoryError> {
        Err(RepositoryError::GoldenCreation("quota exceeded".into()))
    }
}

#[test]
fn failed_golden_creation_writes_no_links() {
    let repository = Arc::new(NoGoldens(InMemoryRecordRepository::new()));
    let manager =
        LinkManager::new(rules(), repository, Arc::new(InMemoryLinkBackend::new())).unwrap();
    let events = Arc::new(CollectingSubscriber::new());
    manager.subscribe(events.clone());

    let err = manager
        .handle_change(ResourceChange::create(patient("p1", "Jose", "Fernandez", "1980-04-12")))
        .unwrap_err();
    assert!(matches!(
        err,
        LinkError::Repository(RepositoryError::GoldenCreation(_))
    ));
    assert!(manager.query_links(&LinkQuery::new()).unwrap().is_empty());
    assert!(events.is_empty());
}

/// Fails the first `conflicts` commits with a version conflict.
struct ConflictingBackend {
    inner: InMemoryLinkBackend,
    conflicts: AtomicUsize,
    commits: AtomicUsize,
}

impl ConflictingBackend {
    fn new(conflicts: usize) -> Self {
        Self {
            inner: InMemoryLinkBackend::new(),
            conflicts: AtomicUsize::new(conflicts),
            commits: AtomicUsize::new(0),
        }
    }
}

impl LinkBackend for ConflictingBackend {
    fn get(&self, key: &str) -> Result<Option<Versioned>, LinkError> {
        self.inner.get(key)
    }

    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), LinkError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(LinkError::VersionConflict {
                key: writes[0].key.clone(),
                expected: writes[0].expected_version,
                actual: writes[0].expected_version + 1,
            });
        }
        self.inner.commit(writes)
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, Versioned) -> Result<(), LinkError>,
    ) -> Result<(), LinkError> {
        self.inner.scan_prefix(prefix, visitor)
    }
}

#[test]
fn version_conflicts_are_retried() {
    let backend = Arc::new(ConflictingBackend::new(2));
    let fx = fixture_with(rules(), backend.clone());

    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12")).unwrap();
    assert_eq!(backend.commits.load(Ordering::SeqCst), 3);
    // The golden prepared on the first attempt is reused by the retries.
    let goldens = fx.repository.goldens("Patient").unwrap();
    assert_eq!(goldens.len(), 1);
    assert_eq!(golden_of(&fx, "p1"), goldens[0].id());
}

#[test]
fn retries_are_bounded() {
    let mut rules = rules();
    rules.max_commit_retries = 1;
    let backend = Arc::new(ConflictingBackend::new(5));
    let fx = fixture_with(rules, backend.clone());

    let err = fx
        .manager
        .handle_change(ResourceChange::create(patient("p1", "Jose", "Fernandez", "1980-04-12")))
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(backend.commits.load(Ordering::SeqCst), 2);
    assert!(fx.events.is_empty());
    assert!(fx.repository.goldens("Patient").unwrap().is_empty());
}

/// Commits `pending` through its own transaction right before the first
/// commit it is handed, as a concurrent operation would.
struct RacingBackend {
    inner: Arc<InMemoryLinkBackend>,
    pending: Mutex<Option<Link>>,
}

impl LinkBackend for RacingBackend {
    fn get(&self, key: &str) -> Result<Option<Versioned>, LinkError> {
        self.inner.get(key)
    }

    fn commit(&self, writes: Vec<VersionedWrite>) -> Result<(), LinkError> {
        if let Some(link) = self.pending.lock().unwrap().take() {
            let store = LinkStore::new(self.inner.clone());
            let mut tx = store.begin();
            tx.put(link)?;
            tx.commit()?;
        }
        self.inner.commit(writes)
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visitor: &mut dyn FnMut(&str, Versioned) -> Result<(), LinkError>,
    ) -> Result<(), LinkError> {
        self.inner.scan_prefix(prefix, visitor)
    }
}

#[test]
fn look_alike_linked_meanwhile_is_joined_on_retry() {
    let backend = Arc::new(RacingBackend {
        inner: Arc::new(InMemoryLinkBackend::new()),
        pending: Mutex::new(None),
    });
    let fx = fixture_with(rules(), backend.clone());

    // p0 is saved but its own linking has not committed yet.
    let p0 = patient("p0", "Jose", "Fernandez", "1980-04-12");
    fx.repository.save(p0.clone()).unwrap();
    let winner = fx.repository.create_golden(&p0).unwrap();
    *backend.pending.lock().unwrap() = Some(Link::auto(
        "Patient",
        "p0",
        winner.id(),
        LinkMatchResult::Match,
    ));

    let event = create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12")).unwrap();
    assert_eq!(event.changes.len(), 1);
    assert_eq!(golden_of(&fx, "p1"), winner.id());
    // The golden prepared for the lost attempt was never persisted.
    assert_eq!(fx.repository.goldens("Patient").unwrap(), vec![winner]);
}

#[test]
fn manual_no_match_on_the_only_match_relinks_the_source() {
    let fx = fixture();
    create(&fx, patient("p1", "Jose", "Fernandez", "1980-04-12"));
    let g1 = golden_of(&fx, "p1");

    let event = fx
        .manager
        .update_link("Patient", "p1", &g1, LinkMatchResult::NoMatch)
        .unwrap()
        .unwrap();
    assert_eq!(event.message.operation, LinkOperation::UpdateLink);
    assert_eq!(event.changes_of(LinkChangeKind::Updated).count(), 1);
    assert_eq!(event.changes_of(LinkChangeKind::Created).count(), 1);

    let g2 = golden_of(&fx, "p1");
    assert_ne!(g2, g1);
    assert_eq!(fx.repository.goldens("Patient").unwrap().len(), 2);
    let rejected = fx
        .manager
        .store()
        .golden_links("Patient", &g1)
        .unwrap()
        .link_from("p1")
        .cloned()
        .unwrap();
    assert!(rejected.is_manual());
    assert_eq!(rejected.match_result, LinkMatchResult::NoMatch);
}
