//! Reproductive status resolution.
//!
//! An explicitly stored status always wins. Recipients without one get a
//! status derived from their latest transfer attempt and their protocol
//! enrollments. Both the single and the batch resolver fill a [`StatusLookup`]
//! and call the same [`StatusLookup::resolve`], so their answers agree.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::warn;

use crate::domain::{
    LinkStatus, ProtocolEnrollment, ProtocolId, ProtocolStatus, Recipient, RecipientId, Status,
    TransferAttempt,
};
use crate::error::{DerivationWarning, TransferError};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Stored,
    Derived,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: Status,
    pub source: StatusSource,
    pub warnings: Vec<DerivationWarning>,
}

impl Resolution {
    fn stored(status: Status) -> Self {
        Self {
            status,
            source: StatusSource::Stored,
            warnings: Vec::new(),
        }
    }

    fn derived(status: Status, warnings: Vec<DerivationWarning>) -> Self {
        Self {
            status,
            source: StatusSource::Derived,
            warnings,
        }
    }

    fn fallback(warning: DerivationWarning) -> Self {
        Self {
            status: Status::Empty,
            source: StatusSource::Fallback,
            warnings: vec![warning],
        }
    }
}

/// Pre-fetched records for a set of recipients.
#[derive(Debug, Default)]
pub struct StatusLookup {
    recipients: HashMap<RecipientId, Recipient>,
    latest_attempts: HashMap<RecipientId, TransferAttempt>,
    enrollments: HashMap<RecipientId, Vec<ProtocolEnrollment>>,
    protocol_statuses: HashMap<ProtocolId, ProtocolStatus>,
    record_failures: HashMap<RecipientId, String>,
    history_failures: HashMap<RecipientId, String>,
}

impl StatusLookup {
    /// Fetches each record kind once for all `ids`. A failed fetch marks the
    /// affected recipients as unresolved instead of failing the whole lookup.
    pub fn gather<S: RecordStore + ?Sized>(store: &S, ids: &[RecipientId]) -> Self {
        let mut lookup = Self::default();

        match store.fetch_recipients(ids) {
            Ok(recipients) => lookup.insert_recipients(recipients),
            Err(err) => lookup.fail_records(ids, &err),
        }
        match store.fetch_latest_transfer_attempts(ids) {
            Ok(attempts) => lookup.latest_attempts = attempts,
            Err(err) => lookup.fail_history(ids, &err),
        }
        match store.fetch_protocol_enrollments(ids) {
            Ok(enrollments) => lookup.insert_enrollments(enrollments),
            Err(err) => lookup.fail_history(ids, &err),
        }
        lookup.gather_protocol_statuses(store);
        lookup
    }

    /// Single-recipient variant of [`StatusLookup::gather`] using the
    /// per-recipient store calls.
    pub fn gather_one<S: RecordStore + ?Sized>(store: &S, id: &RecipientId) -> Self {
        let mut lookup = Self::default();
        let ids = std::slice::from_ref(id);

        match store.fetch_recipient(id) {
            Ok(recipient) => lookup.insert_recipients(recipient),
            Err(err) => lookup.fail_records(ids, &err),
        }
        match store.fetch_latest_transfer_attempt(id) {
            Ok(Some(attempt)) => {
                lookup.latest_attempts.insert(id.clone(), attempt);
            }
            Ok(None) => {}
            Err(err) => lookup.fail_history(ids, &err),
        }
        match store.fetch_protocol_enrollments(ids) {
            Ok(enrollments) => lookup.insert_enrollments(enrollments),
            Err(err) => lookup.fail_history(ids, &err),
        }
        lookup.gather_protocol_statuses(store);
        lookup
    }

    pub fn resolve(&self, id: &RecipientId) -> Resolution {
        let resolution = self.derive(id);
        for warning in &resolution.warnings {
            warn!(recipient = %id, status = %resolution.status, "{warning}");
        }
        resolution
    }

    fn derive(&self, id: &RecipientId) -> Resolution {
        if let Some(message) = self.record_failures.get(id) {
            return Resolution::fallback(self.lookup_failed(id, message));
        }
        let Some(recipient) = self.recipients.get(id) else {
            return Resolution::fallback(DerivationWarning::RecipientMissing(id.clone()));
        };
        if let Some(status) = recipient.stored_status {
            return Resolution::stored(status);
        }
        if let Some(message) = self.history_failures.get(id) {
            return Resolution::fallback(self.lookup_failed(id, message));
        }

        if let Some(attempt) = self.latest_attempts.get(id) {
            return Resolution::derived(attempt.effective_outcome().status(), Vec::new());
        }

        let enrollments = self
            .enrollments
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut warnings = Vec::new();
        let mut any_active = false;
        let mut any_active_ready = false;
        for enrollment in enrollments {
            let Some(protocol) = self.protocol_statuses.get(&enrollment.protocol_id) else {
                warnings.push(DerivationWarning::UnknownProtocol {
                    recipient: id.clone(),
                    protocol: enrollment.protocol_id.clone(),
                });
                continue;
            };
            if enrollment.is_active(*protocol) {
                any_active = true;
                any_active_ready |= enrollment.status == LinkStatus::Ready;
            }
        }

        let status = if any_active_ready {
            Status::Synchronized
        } else if any_active {
            Status::Synchronizing
        } else if enrollments.iter().any(|e| e.status == LinkStatus::Ready) {
            // finished synchronization, no attempt yet
            Status::Synchronized
        } else {
            Status::Empty
        };
        Resolution::derived(status, warnings)
    }

    fn lookup_failed(&self, id: &RecipientId, message: &str) -> DerivationWarning {
        DerivationWarning::LookupFailed {
            recipient: id.clone(),
            message: message.to_string(),
        }
    }

    fn insert_recipients(&mut self, recipients: impl IntoIterator<Item = Recipient>) {
        for recipient in recipients {
            self.recipients.insert(recipient.id.clone(), recipient);
        }
    }

    fn insert_enrollments(&mut self, enrollments: Vec<ProtocolEnrollment>) {
        for enrollment in enrollments {
            self.enrollments
                .entry(enrollment.recipient_id.clone())
                .or_default()
                .push(enrollment);
        }
    }

    fn gather_protocol_statuses<S: RecordStore + ?Sized>(&mut self, store: &S) {
        let protocol_ids = self
            .enrollments
            .values()
            .flatten()
            .map(|e| e.protocol_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if protocol_ids.is_empty() {
            return;
        }
        match store.fetch_protocol_statuses(&protocol_ids) {
            Ok(statuses) => self.protocol_statuses = statuses,
            Err(err) => {
                let affected = self.enrollments.keys().cloned().collect::<Vec<_>>();
                self.fail_history(&affected, &err);
            }
        }
    }

    fn fail_records(&mut self, ids: &[RecipientId], err: &TransferError) {
        for id in ids {
            self.record_failures.insert(id.clone(), err.to_string());
        }
    }

    fn fail_history(&mut self, ids: &[RecipientId], err: &TransferError) {
        for id in ids {
            self.history_failures
                .entry(id.clone())
                .or_insert_with(|| err.to_string());
        }
    }
}

pub struct StatusResolver<'a, S: RecordStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RecordStore + ?Sized> StatusResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn resolve(&self, id: &RecipientId) -> Status {
        self.resolve_detailed(id).status
    }

    pub fn resolve_detailed(&self, id: &RecipientId) -> Resolution {
        StatusLookup::gather_one(self.store, id).resolve(id)
    }
}

pub struct BatchStatusResolver<'a, S: RecordStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RecordStore + ?Sized> BatchStatusResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn resolve_many(&self, ids: &BTreeSet<RecipientId>) -> BTreeMap<RecipientId, Status> {
        self.resolve_many_detailed(ids)
            .into_iter()
            .map(|(id, resolution)| (id, resolution.status))
            .collect()
    }

    pub fn resolve_many_detailed(
        &self,
        ids: &BTreeSet<RecipientId>,
    ) -> BTreeMap<RecipientId, Resolution> {
        if ids.is_empty() {
            return BTreeMap::new();
        }
        let list = ids.iter().cloned().collect::<Vec<_>>();
        let lookup = StatusLookup::gather(self.store, &list);
        list.into_iter()
            .map(|id| {
                let resolution = lookup.resolve(&id);
                (id, resolution)
            })
            .collect()
    }
}
