use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use kira_transfer_manager::domain::{
    Diagnosis, Embryo, EmbryoId, EmbryoSource, FarmId, LinkStatus, Outcome, ProtocolEnrollment,
    ProtocolId, ProtocolLinkId, ProtocolStatus, Recipient, RecipientId, Status, TransferAttempt,
    TransferId, TransferKind,
};
use kira_transfer_manager::error::{DerivationWarning, TransferError};
use kira_transfer_manager::status::{BatchStatusResolver, StatusResolver, StatusSource};
use kira_transfer_manager::store::{
    Dataset, MemoryStore, NewTransferAttempt, ProtocolRecord, RecordStore,
};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
}

fn recipient(id: &str, stored: Option<Status>) -> Recipient {
    Recipient {
        id: RecipientId::new(id),
        tag: id.to_uppercase(),
        name: None,
        stored_status: stored,
        farm_id: FarmId::new("farm-1"),
    }
}

fn attempt(id: &str, recipient: &str, day: u32, outcome: Option<Outcome>) -> TransferAttempt {
    TransferAttempt {
        id: TransferId::new(id),
        embryo_id: EmbryoId::new(format!("e-{id}")),
        recipient_id: RecipientId::new(recipient),
        protocol_link_id: None,
        farm_id: FarmId::new("farm-1"),
        transferred_on: date(day),
        kind: TransferKind::Fresh,
        veterinarian: "Dr. Lima".to_string(),
        technician: None,
        notes: None,
        outcome,
        write_key: None,
    }
}

fn enrollment(recipient: &str, protocol: &str, status: LinkStatus) -> ProtocolEnrollment {
    ProtocolEnrollment {
        id: ProtocolLinkId::new(format!("pr-{recipient}-{protocol}")),
        recipient_id: RecipientId::new(recipient),
        protocol_id: ProtocolId::new(protocol),
        status,
        unfit_reason: None,
    }
}

fn protocol(id: &str, status: ProtocolStatus) -> ProtocolRecord {
    ProtocolRecord {
        id: ProtocolId::new(id),
        status,
    }
}

fn dataset() -> Dataset {
    Dataset {
        recipients: vec![
            recipient("r-stored", Some(Status::Pregnant)),
            recipient("r-retouch", None),
            recipient("r-pending", None),
            recipient("r-diag", None),
            recipient("r-newer", None),
            recipient("r-sync", None),
            recipient("r-syncing", None),
            recipient("r-finished", None),
            recipient("r-unfit", None),
            recipient("r-none", None),
            recipient("r-orphan", None),
        ],
        protocols: vec![
            protocol("p-open", ProtocolStatus::Open),
            protocol("p-step1", ProtocolStatus::Step1Closed),
            protocol("p-closed", ProtocolStatus::Step2Closed),
        ],
        enrollments: vec![
            enrollment("r-sync", "p-open", LinkStatus::Ready),
            enrollment("r-sync", "p-closed", LinkStatus::Used),
            enrollment("r-syncing", "p-step1", LinkStatus::Active),
            enrollment("r-finished", "p-closed", LinkStatus::Ready),
            enrollment("r-unfit", "p-open", LinkStatus::Unfit),
            enrollment("r-orphan", "p-ghost", LinkStatus::Ready),
            // attempts take precedence over enrollments
            enrollment("r-retouch", "p-open", LinkStatus::Ready),
        ],
        attempts: vec![
            attempt("t-1", "r-stored", 1, Some(Outcome::Empty)),
            attempt("t-2", "r-retouch", 2, Some(Outcome::Retouch)),
            attempt("t-3", "r-pending", 3, None),
            attempt("t-4", "r-diag", 4, None),
            attempt("t-5", "r-newer", 10, Some(Outcome::Empty)),
            attempt("t-6", "r-newer", 1, Some(Outcome::Pregnant)),
        ],
        diagnoses: vec![Diagnosis {
            attempt_id: TransferId::new("t-4"),
            examined_on: date(20),
            outcome: Outcome::PregnantFemale,
        }],
        embryos: Vec::new(),
        free_heat: Vec::new(),
    }
}

fn all_ids() -> BTreeSet<RecipientId> {
    dataset()
        .recipients
        .into_iter()
        .map(|r| r.id)
        .chain([RecipientId::new("r-ghost")])
        .collect()
}

/// Delegates to a [`MemoryStore`] and fails the record kinds it is told to.
/// Single and bulk variants of the same kind fail together.
struct FlakyStore {
    inner: MemoryStore,
    failing: Mutex<HashSet<&'static str>>,
    bulk_calls: Mutex<HashMap<&'static str, usize>>,
}

impl FlakyStore {
    fn new(dataset: Dataset) -> Self {
        Self {
            inner: MemoryStore::new(dataset),
            failing: Mutex::new(HashSet::new()),
            bulk_calls: Mutex::new(HashMap::new()),
        }
    }

    fn fail(&self, kind: &'static str) {
        self.failing.lock().unwrap().insert(kind);
    }

    fn calls(&self, kind: &'static str) -> usize {
        self.bulk_calls
            .lock()
            .unwrap()
            .get(kind)
            .copied()
            .unwrap_or_default()
    }

    fn guard(&self, kind: &'static str) -> Result<(), TransferError> {
        if self.failing.lock().unwrap().contains(kind) {
            return Err(TransferError::StoreUnavailable(format!("{kind} offline")));
        }
        Ok(())
    }

    fn count(&self, kind: &'static str) {
        *self.bulk_calls.lock().unwrap().entry(kind).or_default() += 1;
    }
}

impl RecordStore for FlakyStore {
    fn fetch_recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, TransferError> {
        self.guard("recipients")?;
        self.inner.fetch_recipient(id)
    }

    fn fetch_recipients(&self, ids: &[RecipientId]) -> Result<Vec<Recipient>, TransferError> {
        self.count("recipients");
        self.guard("recipients")?;
        self.inner.fetch_recipients(ids)
    }

    fn fetch_farm_recipients(&self, farm: &FarmId) -> Result<Vec<Recipient>, TransferError> {
        self.guard("recipients")?;
        self.inner.fetch_farm_recipients(farm)
    }

    fn fetch_free_heat_recipients(&self, farm: &FarmId) -> Result<Vec<RecipientId>, TransferError> {
        self.inner.fetch_free_heat_recipients(farm)
    }

    fn fetch_latest_transfer_attempt(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<TransferAttempt>, TransferError> {
        self.guard("attempts")?;
        self.inner.fetch_latest_transfer_attempt(recipient)
    }

    fn fetch_latest_transfer_attempts(
        &self,
        recipients: &[RecipientId],
    ) -> Result<HashMap<RecipientId, TransferAttempt>, TransferError> {
        self.count("attempts");
        self.guard("attempts")?;
        self.inner.fetch_latest_transfer_attempts(recipients)
    }

    fn fetch_transfer_attempts(
        &self,
        ids: &[TransferId],
    ) -> Result<Vec<TransferAttempt>, TransferError> {
        self.guard("attempts")?;
        self.inner.fetch_transfer_attempts(ids)
    }

    fn fetch_protocol_enrollments(
        &self,
        recipients: &[RecipientId],
    ) -> Result<Vec<ProtocolEnrollment>, TransferError> {
        self.count("enrollments");
        self.guard("enrollments")?;
        self.inner.fetch_protocol_enrollments(recipients)
    }

    fn fetch_protocol_statuses(
        &self,
        protocols: &[ProtocolId],
    ) -> Result<HashMap<ProtocolId, ProtocolStatus>, TransferError> {
        self.count("protocols");
        self.guard("protocols")?;
        self.inner.fetch_protocol_statuses(protocols)
    }

    fn fetch_available_embryos(
        &self,
        source: &EmbryoSource,
    ) -> Result<Vec<Embryo>, TransferError> {
        self.inner.fetch_available_embryos(source)
    }

    fn fetch_embryo_transfer(
        &self,
        embryo: &EmbryoId,
    ) -> Result<Option<TransferAttempt>, TransferError> {
        self.inner.fetch_embryo_transfer(embryo)
    }

    fn write_transfer_attempt(
        &self,
        record: &NewTransferAttempt,
    ) -> Result<TransferId, TransferError> {
        self.inner.write_transfer_attempt(record)
    }

    fn mark_embryo_transferred(&self, embryo: &EmbryoId) -> Result<(), TransferError> {
        self.inner.mark_embryo_transferred(embryo)
    }

    fn update_recipient_status(
        &self,
        recipient: &RecipientId,
        status: Status,
    ) -> Result<(), TransferError> {
        self.inner.update_recipient_status(recipient, status)
    }

    fn update_protocol_link_status(
        &self,
        link: &ProtocolLinkId,
        status: LinkStatus,
        reason: Option<&str>,
    ) -> Result<(), TransferError> {
        self.inner.update_protocol_link_status(link, status, reason)
    }

    fn discard_free_heat(&self, recipient: &RecipientId) -> Result<(), TransferError> {
        self.inner.discard_free_heat(recipient)
    }

    fn close_transfer_session(
        &self,
        recipients: &[RecipientId],
        links: &[ProtocolLinkId],
    ) -> Result<(), TransferError> {
        self.inner.close_transfer_session(recipients, links)
    }
}

fn single_statuses<S: RecordStore>(store: &S, ids: &BTreeSet<RecipientId>) -> Vec<Status> {
    let resolver = StatusResolver::new(store);
    ids.iter().map(|id| resolver.resolve(id)).collect()
}

fn batch_statuses<S: RecordStore>(store: &S, ids: &BTreeSet<RecipientId>) -> Vec<Status> {
    BatchStatusResolver::new(store)
        .resolve_many(ids)
        .into_values()
        .collect()
}

#[test]
fn resolves_each_derivation_path() {
    let store = MemoryStore::new(dataset());
    let resolver = StatusResolver::new(&store);
    let expect = [
        ("r-stored", Status::Pregnant),
        ("r-retouch", Status::Served),
        ("r-pending", Status::Served),
        ("r-diag", Status::PregnantFemale),
        ("r-newer", Status::Empty),
        ("r-sync", Status::Synchronized),
        ("r-syncing", Status::Synchronizing),
        ("r-finished", Status::Synchronized),
        ("r-unfit", Status::Empty),
        ("r-none", Status::Empty),
        ("r-orphan", Status::Synchronized),
        ("r-ghost", Status::Empty),
    ];
    for (id, status) in expect {
        assert_eq!(resolver.resolve(&RecipientId::new(id)), status, "{id}");
    }
}

#[test]
fn stored_status_wins_over_history() {
    let store = MemoryStore::new(dataset());
    let resolution = StatusResolver::new(&store).resolve_detailed(&RecipientId::new("r-stored"));
    assert_eq!(resolution.status, Status::Pregnant);
    assert_eq!(resolution.source, StatusSource::Stored);
    assert!(resolution.warnings.is_empty());
}

#[test]
fn missing_recipient_falls_back_with_warning() {
    let store = MemoryStore::new(dataset());
    let resolution = StatusResolver::new(&store).resolve_detailed(&RecipientId::new("r-ghost"));
    assert_eq!(resolution.status, Status::Empty);
    assert_eq!(resolution.source, StatusSource::Fallback);
    assert_matches!(
        resolution.warnings.as_slice(),
        [DerivationWarning::RecipientMissing(_)]
    );
}

#[test]
fn unknown_protocol_reported_but_ready_link_still_counts() {
    let store = MemoryStore::new(dataset());
    let resolution = StatusResolver::new(&store).resolve_detailed(&RecipientId::new("r-orphan"));
    assert_eq!(resolution.status, Status::Synchronized);
    assert_matches!(
        resolution.warnings.as_slice(),
        [DerivationWarning::UnknownProtocol { .. }]
    );
}

#[test]
fn batch_matches_single_resolution() {
    let store = MemoryStore::new(dataset());
    let ids = all_ids();
    assert_eq!(single_statuses(&store, &ids), batch_statuses(&store, &ids));

    let single = StatusResolver::new(&store);
    let detailed = BatchStatusResolver::new(&store).resolve_many_detailed(&ids);
    for (id, resolution) in detailed {
        assert_eq!(resolution, single.resolve_detailed(&id), "{id}");
    }
}

#[test]
fn batch_matches_single_under_failures() {
    for kind in ["recipients", "attempts", "enrollments", "protocols"] {
        let store = FlakyStore::new(dataset());
        store.fail(kind);
        let ids = all_ids();
        assert_eq!(
            single_statuses(&store, &ids),
            batch_statuses(&store, &ids),
            "failing {kind}"
        );
    }
}

#[test]
fn failed_fetch_never_yields_pregnancy() {
    let store = FlakyStore::new(dataset());
    store.fail("attempts");
    let resolutions = BatchStatusResolver::new(&store).resolve_many_detailed(&all_ids());

    let diag = &resolutions[&RecipientId::new("r-diag")];
    assert_eq!(diag.status, Status::Empty);
    assert_eq!(diag.source, StatusSource::Fallback);
    assert_matches!(
        diag.warnings.as_slice(),
        [DerivationWarning::LookupFailed { .. }]
    );
    // stored statuses do not depend on history
    assert_eq!(
        resolutions[&RecipientId::new("r-stored")].status,
        Status::Pregnant
    );
}

#[test]
fn batch_fetches_each_kind_once() {
    let store = FlakyStore::new(dataset());
    let statuses = BatchStatusResolver::new(&store).resolve_many(&all_ids());
    assert_eq!(statuses.len(), all_ids().len());
    for kind in ["recipients", "attempts", "enrollments", "protocols"] {
        assert_eq!(store.calls(kind), 1, "{kind}");
    }
}

#[test]
fn empty_batch_makes_no_calls() {
    let store = FlakyStore::new(dataset());
    let statuses = BatchStatusResolver::new(&store).resolve_many(&BTreeSet::new());
    assert!(statuses.is_empty());
    assert_eq!(store.calls("recipients"), 0);
}
