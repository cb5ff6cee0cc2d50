//! Session-scoped bookkeeping for one farm visit.
//!
//! [`TransferSession`] is plain data. [`TransferSessionAggregator`] owns it and
//! is the only place it changes. Submitting a transfer reserves a slot before
//! the durable write is issued; the reconciler later confirms or rolls back
//! the reservation. The per-recipient cap counts reservations, so two
//! submissions can never both see a free slot that only one can fill.
//!
//! A write that failed without an answer from the store may still have
//! landed. Its ticket is kept as unsettled: retrying the same transfer reuses
//! the ticket's write key, and the reconciler settles what is left against
//! the store before the session closes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    Embryo, EmbryoId, EmbryoSource, FarmId, ProtocolLinkId, RecipientId, RecipientOrigin, Status,
    TransferAttempt, TransferId,
};
use crate::error::TransferError;
use crate::report::{SessionReportItem, SessionSummary};
use crate::store::NewTransferAttempt;
use crate::transition::{self, Action};

pub const MAX_EMBRYOS_PER_RECIPIENT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Empty,
    Active,
    Closed,
}

/// A recipient offered for transfer on the session's farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolEntry {
    pub recipient_id: RecipientId,
    pub tag: String,
    pub origin: RecipientOrigin,
    pub status: Status,
}

impl PoolEntry {
    /// Status used by the transfer gate. Free-heat recipients are ready by
    /// definition, whatever their recorded status.
    pub fn transfer_status(&self) -> Status {
        match self.origin {
            RecipientOrigin::FreeHeat => Status::Synchronized,
            RecipientOrigin::Protocol { .. } => self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisibleRecipient {
    #[serde(flatten)]
    pub entry: PoolEntry,
    pub embryos_this_session: u8,
    /// Already holds one embryo from this session; the next one is the last.
    pub second_embryo: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCount {
    pub committed: u8,
    pub pending: u8,
}

impl SlotCount {
    pub fn total(self) -> u8 {
        self.committed + self.pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub embryo_id: EmbryoId,
    pub recipient_id: RecipientId,
    pub transferred_on: NaiveDate,
    pub veterinarian: String,
    pub technician: Option<String>,
    pub notes: Option<String>,
}

/// A reserved slot waiting for its durable write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub record: NewTransferAttempt,
    pub origin: RecipientOrigin,
    pub recipient_tag: String,
    pub embryo_label: String,
    pub classification: Option<String>,
}

impl PendingTransfer {
    pub fn key(&self) -> &str {
        &self.record.write_key
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitReceipt {
    Committed { transfer: TransferId, embryos: u8 },
    AlreadyCommitted(TransferId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscardOrder {
    pub entry: PoolEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOrder {
    pub recipients: Vec<RecipientId>,
    pub links: Vec<ProtocolLinkId>,
    pub transfers: Vec<TransferId>,
}

/// Persistable part of a session; counts are rebuilt from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub farm_id: FarmId,
    pub source: EmbryoSource,
    #[serde(default)]
    pub allow_second_embryo: bool,
    pub phase: SessionPhase,
    #[serde(default)]
    pub committed_writes: Vec<TransferId>,
    #[serde(default)]
    pub touched_links: Vec<ProtocolLinkId>,
    #[serde(default)]
    pub discarded: BTreeSet<RecipientId>,
    #[serde(default)]
    pub selection: Option<RecipientId>,
    #[serde(default)]
    pub unsettled: Vec<PendingTransfer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    id: Uuid,
    farm_id: FarmId,
    source: EmbryoSource,
    allow_second_embryo: bool,
    phase: SessionPhase,
    tally: BTreeMap<RecipientId, SlotCount>,
    committed_writes: Vec<TransferId>,
    touched_links: Vec<ProtocolLinkId>,
    served: BTreeMap<RecipientId, PoolEntry>,
    pool: Vec<PoolEntry>,
    embryos: Vec<Embryo>,
    discarded: BTreeSet<RecipientId>,
    selection: Option<RecipientId>,
    pending: BTreeMap<String, PendingTransfer>,
    unsettled: BTreeMap<String, PendingTransfer>,
    report: Vec<SessionReportItem>,
}

impl TransferSession {
    fn new(farm_id: FarmId, source: EmbryoSource, allow_second_embryo: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            farm_id,
            source,
            allow_second_embryo,
            phase: SessionPhase::Empty,
            tally: BTreeMap::new(),
            committed_writes: Vec::new(),
            touched_links: Vec::new(),
            served: BTreeMap::new(),
            pool: Vec::new(),
            embryos: Vec::new(),
            discarded: BTreeSet::new(),
            selection: None,
            pending: BTreeMap::new(),
            unsettled: BTreeMap::new(),
            report: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn farm_id(&self) -> &FarmId {
        &self.farm_id
    }

    pub fn source(&self) -> &EmbryoSource {
        &self.source
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn allow_second_embryo(&self) -> bool {
        self.allow_second_embryo
    }

    /// Optimistic count: committed plus in-flight embryos.
    pub fn embryos_this_session(&self, recipient: &RecipientId) -> u8 {
        self.slot(recipient).total()
    }

    pub fn slot(&self, recipient: &RecipientId) -> SlotCount {
        self.tally.get(recipient).copied().unwrap_or_default()
    }

    pub fn committed_writes(&self) -> &[TransferId] {
        &self.committed_writes
    }

    pub fn touched_links(&self) -> &[ProtocolLinkId] {
        &self.touched_links
    }

    pub fn pending_writes(&self) -> impl Iterator<Item = &PendingTransfer> {
        self.pending.values()
    }

    /// Rolled-back writes whose outcome in the store is unknown.
    pub fn unsettled_writes(&self) -> impl Iterator<Item = &PendingTransfer> {
        self.unsettled.values()
    }

    pub fn embryos(&self) -> &[Embryo] {
        &self.embryos
    }

    /// Transfer already committed in this session for this embryo and
    /// recipient.
    pub fn committed_transfer(
        &self,
        embryo: &EmbryoId,
        recipient: &RecipientId,
    ) -> Option<&TransferId> {
        self.report
            .iter()
            .find(|item| &item.embryo_id == embryo && &item.recipient_id == recipient)
            .map(|item| &item.transfer_id)
    }

    pub fn discarded(&self) -> &BTreeSet<RecipientId> {
        &self.discarded
    }

    pub fn selection(&self) -> Option<&RecipientId> {
        self.selection.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            farm_id: self.farm_id.clone(),
            source: self.source.clone(),
            allow_second_embryo: self.allow_second_embryo,
            phase: self.phase,
            committed_writes: self.committed_writes.clone(),
            touched_links: self.touched_links.clone(),
            discarded: self.discarded.clone(),
            selection: self.selection.clone(),
            unsettled: self.unsettled.values().cloned().collect(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.to_string(),
            farm_id: self.farm_id.clone(),
            source: self.source.clone(),
            phase: self.phase,
            committed: self.committed_writes.len(),
            pending: self.pending.len(),
            recipients_served: self.tally.values().filter(|s| s.committed > 0).count(),
            discarded: self.discarded.iter().cloned().collect(),
            items: self.report.clone(),
        }
    }

    fn visible_limit(&self) -> u8 {
        if self.allow_second_embryo {
            MAX_EMBRYOS_PER_RECIPIENT
        } else {
            1
        }
    }

    fn unsettled_for(&self, embryo: &EmbryoId, recipient: &RecipientId) -> Option<&PendingTransfer> {
        self.unsettled.values().find(|ticket| {
            &ticket.record.embryo_id == embryo && &ticket.record.recipient_id == recipient
        })
    }

    fn unsettled_count(&self, recipient: &RecipientId) -> u8 {
        let count = self
            .unsettled
            .values()
            .filter(|ticket| &ticket.record.recipient_id == recipient)
            .count();
        u8::try_from(count).unwrap_or(u8::MAX)
    }

    fn pool_entry(&self, recipient: &RecipientId) -> Option<&PoolEntry> {
        self.pool.iter().find(|entry| &entry.recipient_id == recipient)
    }

    fn is_visible(&self, recipient: &RecipientId) -> bool {
        !self.discarded.contains(recipient)
            && self.pool_entry(recipient).is_some()
            && self.embryos_this_session(recipient) < self.visible_limit()
    }
}

pub struct TransferSessionAggregator {
    session: TransferSession,
}

impl TransferSessionAggregator {
    pub fn new(farm_id: FarmId, source: EmbryoSource, allow_second_embryo: bool) -> Self {
        Self {
            session: TransferSession::new(farm_id, source, allow_second_embryo),
        }
    }

    /// Starts from a persisted snapshot. Per-recipient counts stay empty until
    /// the reconciler replays the committed transfers.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut session = TransferSession::new(
            snapshot.farm_id,
            snapshot.source,
            snapshot.allow_second_embryo,
        );
        session.id = snapshot.session_id;
        session.phase = snapshot.phase;
        session.touched_links = snapshot.touched_links;
        session.discarded = snapshot.discarded;
        session.selection = snapshot.selection;
        session.unsettled = snapshot
            .unsettled
            .into_iter()
            .map(|ticket| (ticket.key().to_string(), ticket))
            .collect();
        Self { session }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn into_session(self) -> TransferSession {
        self.session
    }

    pub fn set_allow_second_embryo(&mut self, allow: bool) -> Result<(), TransferError> {
        self.ensure_open()?;
        self.session.allow_second_embryo = allow;
        Ok(())
    }

    pub fn select_recipient(&mut self, recipient: &RecipientId) -> Result<(), TransferError> {
        self.ensure_open()?;
        if !self.session.is_visible(recipient) {
            return Err(TransferError::RecipientNotInPool(recipient.clone()));
        }
        self.session.selection = Some(recipient.clone());
        Ok(())
    }

    /// Recipients that can take an embryo now. With the second-embryo toggle
    /// off only untouched recipients show; with it on, recipients holding one
    /// embryo show as well, flagged.
    pub fn visible_pool(&self) -> Vec<VisibleRecipient> {
        self.session
            .pool
            .iter()
            .filter(|entry| self.session.is_visible(&entry.recipient_id))
            .map(|entry| {
                let embryos = self.session.embryos_this_session(&entry.recipient_id);
                VisibleRecipient {
                    entry: entry.clone(),
                    embryos_this_session: embryos,
                    second_embryo: embryos == 1,
                }
            })
            .collect()
    }

    /// Validates the request and reserves a slot. The returned ticket is the
    /// durable write to issue; hand its outcome to the reconciler.
    ///
    /// Repeating a transfer whose earlier write is unsettled reserves the
    /// earlier ticket again, as recorded then, so the store can match its
    /// write key.
    pub fn submit_transfer(
        &mut self,
        request: TransferRequest,
    ) -> Result<PendingTransfer, TransferError> {
        self.ensure_open()?;
        if let Some(ticket) = self
            .session
            .unsettled_for(&request.embryo_id, &request.recipient_id)
            .cloned()
        {
            return self.resubmit(&ticket);
        }
        let veterinarian = request.veterinarian.trim();
        if veterinarian.is_empty() {
            return Err(TransferError::MissingVeterinarian);
        }

        let recipient = &request.recipient_id;
        let embryos = self.session.embryos_this_session(recipient);
        if embryos + self.session.unsettled_count(recipient) >= MAX_EMBRYOS_PER_RECIPIENT {
            return Err(TransferError::SlotLimitReached(recipient.clone()));
        }
        if !self.session.is_visible(recipient) {
            return Err(TransferError::RecipientNotInPool(recipient.clone()));
        }
        let entry = self
            .session
            .pool_entry(recipient)
            .cloned()
            .ok_or_else(|| TransferError::RecipientNotInPool(recipient.clone()))?;
        if embryos == 0 {
            transition::check(entry.transfer_status(), Action::PerformTransfer)?;
        }
        let embryo = self.available_embryo(&request.embryo_id)?.clone();

        let pending = PendingTransfer {
            record: NewTransferAttempt {
                write_key: Uuid::new_v4().to_string(),
                embryo_id: request.embryo_id,
                recipient_id: request.recipient_id,
                protocol_link_id: entry.origin.protocol_link().cloned(),
                farm_id: self.session.farm_id.clone(),
                transferred_on: request.transferred_on,
                kind: self.session.source.transfer_kind(),
                veterinarian: veterinarian.to_string(),
                technician: trimmed(request.technician),
                notes: trimmed(request.notes),
            },
            origin: entry.origin,
            recipient_tag: entry.tag,
            embryo_label: embryo.label,
            classification: embryo.classification,
        };
        self.reserve(&pending);
        Ok(pending)
    }

    /// Reserves the slot again for a transfer whose write was rolled back,
    /// keeping its write key so the store can recognize a repeated write.
    pub fn resubmit(&mut self, pending: &PendingTransfer) -> Result<PendingTransfer, TransferError> {
        self.ensure_open()?;
        if self.session.pending.contains_key(pending.key()) {
            return Ok(pending.clone());
        }
        let recipient = &pending.record.recipient_id;
        if self.session.discarded.contains(recipient) {
            return Err(TransferError::RecipientNotInPool(recipient.clone()));
        }
        if self.session.embryos_this_session(recipient) >= MAX_EMBRYOS_PER_RECIPIENT {
            return Err(TransferError::SlotLimitReached(recipient.clone()));
        }
        // the store may no longer list an embryo whose write landed
        if self.is_reserved(&pending.record.embryo_id, Some(pending.key())) {
            return Err(TransferError::EmbryoUnavailable(pending.record.embryo_id.clone()));
        }
        self.reserve(pending);
        Ok(pending.clone())
    }

    /// Turns a reservation into a committed transfer. Replaying the same
    /// transfer id is a no-op.
    pub fn confirm_write(
        &mut self,
        key: &str,
        transfer: TransferId,
    ) -> Result<CommitReceipt, TransferError> {
        let Some(pending) = self.session.pending.remove(key) else {
            if self.session.committed_writes.contains(&transfer) {
                return Ok(CommitReceipt::AlreadyCommitted(transfer));
            }
            return Err(TransferError::UnknownWrite(key.to_string()));
        };
        let recipient = pending.record.recipient_id.clone();
        let slot = self.session.tally.entry(recipient.clone()).or_default();
        slot.pending = slot.pending.saturating_sub(1);

        if self.session.committed_writes.contains(&transfer) {
            self.prune_slot(&recipient);
            return Ok(CommitReceipt::AlreadyCommitted(transfer));
        }

        slot.committed += 1;
        let embryos = slot.committed;
        self.session.committed_writes.push(transfer.clone());
        if let Some(link) = &pending.record.protocol_link_id {
            if !self.session.touched_links.contains(link) {
                self.session.touched_links.push(link.clone());
            }
        }
        let entry = match self.session.pool_entry(&recipient) {
            Some(entry) => entry.clone(),
            None => PoolEntry {
                recipient_id: recipient.clone(),
                tag: pending.recipient_tag.clone(),
                origin: pending.origin.clone(),
                status: Status::Served,
            },
        };
        self.session.served.insert(recipient.clone(), entry);
        self.session
            .embryos
            .retain(|embryo| embryo.id != pending.record.embryo_id);
        self.session.report.push(report_item(&pending, &transfer, embryos));

        info!(
            transfer = %transfer,
            recipient = %recipient,
            embryo = %pending.record.embryo_id,
            embryos,
            "transfer committed"
        );
        Ok(CommitReceipt::Committed { transfer, embryos })
    }

    /// Keeps a rolled-back ticket for a later retry or settlement.
    pub(crate) fn hold_unsettled(&mut self, pending: PendingTransfer) {
        debug!(key = pending.key(), embryo = %pending.record.embryo_id, "write held as unsettled");
        self.session
            .unsettled
            .insert(pending.key().to_string(), pending);
    }

    /// Forgets an unsettled ticket the store never recorded.
    pub(crate) fn drop_unsettled(&mut self, key: &str) -> Option<PendingTransfer> {
        self.session.unsettled.remove(key)
    }

    /// Drops a reservation whose write did not go through.
    pub fn reject_write(&mut self, key: &str) -> Result<PendingTransfer, TransferError> {
        let pending = self
            .session
            .pending
            .remove(key)
            .ok_or_else(|| TransferError::UnknownWrite(key.to_string()))?;
        let recipient = pending.record.recipient_id.clone();
        if let Some(slot) = self.session.tally.get_mut(&recipient) {
            slot.pending = slot.pending.saturating_sub(1);
        }
        self.prune_slot(&recipient);
        debug!(recipient = %recipient, key, "reservation rolled back");
        Ok(pending)
    }

    /// Takes a recipient out of the pool for the rest of the session. The
    /// returned order carries the store updates; `None` means it was already
    /// discarded.
    pub fn discard_recipient(
        &mut self,
        recipient: &RecipientId,
    ) -> Result<Option<DiscardOrder>, TransferError> {
        self.ensure_open()?;
        if self.session.discarded.contains(recipient) {
            self.session.selection = None;
            return Ok(None);
        }
        if self.session.embryos_this_session(recipient) > 0
            || self.session.unsettled_count(recipient) > 0
        {
            return Err(TransferError::RecipientAlreadyServed(recipient.clone()));
        }
        let entry = self
            .session
            .pool_entry(recipient)
            .cloned()
            .ok_or_else(|| TransferError::UnknownRecipient(recipient.clone()))?;

        self.session.discarded.insert(recipient.clone());
        self.session
            .pool
            .retain(|entry| &entry.recipient_id != recipient);
        self.session.selection = None;
        info!(recipient = %recipient, "recipient discarded from session");
        Ok(Some(DiscardOrder { entry }))
    }

    /// Puts a discarded recipient back after its store update failed.
    pub(crate) fn undo_discard(&mut self, order: &DiscardOrder) {
        let recipient = &order.entry.recipient_id;
        if self.session.discarded.remove(recipient) && self.session.pool_entry(recipient).is_none()
        {
            self.session.pool.push(order.entry.clone());
        }
    }

    /// Checks the session can close and lists what the store must transition.
    /// Nothing changes locally until [`Self::finish_close`].
    pub fn prepare_close(&self) -> Result<CloseOrder, TransferError> {
        self.ensure_open()?;
        if self.session.committed_writes.is_empty() {
            return Err(TransferError::EmptySession);
        }
        let in_flight = self.session.pending.len() + self.session.unsettled.len();
        if in_flight > 0 {
            return Err(TransferError::WritesPending(in_flight));
        }
        Ok(CloseOrder {
            recipients: self
                .session
                .tally
                .iter()
                .filter(|(_, slot)| slot.committed > 0)
                .map(|(id, _)| id.clone())
                .collect(),
            links: self.session.touched_links.clone(),
            transfers: self.session.committed_writes.clone(),
        })
    }

    /// Clears the session after the store accepted the close order and
    /// returns the final summary.
    pub fn finish_close(&mut self) -> SessionSummary {
        self.session.phase = SessionPhase::Closed;
        let summary = self.session.summary();
        let session = &mut self.session;
        session.tally.clear();
        session.committed_writes.clear();
        session.touched_links.clear();
        session.served.clear();
        session.pool.clear();
        session.embryos.clear();
        session.discarded.clear();
        session.selection = None;
        session.pending.clear();
        session.unsettled.clear();
        session.report.clear();
        info!(session = %session.id, transfers = summary.committed, "session closed");
        summary
    }

    /// Replaces the candidate pool. Recipients that already hold an embryo
    /// from this session stay listed even when the store no longer offers
    /// them; discarded recipients never come back.
    pub fn replace_pool(&mut self, entries: Vec<PoolEntry>) {
        let session = &mut self.session;
        let mut pool = entries
            .into_iter()
            .filter(|entry| !session.discarded.contains(&entry.recipient_id))
            .collect::<Vec<_>>();
        for (id, entry) in &session.served {
            if !pool.iter().any(|e| &e.recipient_id == id) {
                pool.push(entry.clone());
            }
        }
        session.pool = pool;
        if let Some(selected) = session.selection.clone() {
            if !session.is_visible(&selected) {
                session.selection = None;
            }
        }
        debug!(farm = %session.farm_id, recipients = session.pool.len(), "pool refreshed");
    }

    pub fn replace_embryos(&mut self, embryos: Vec<Embryo>) {
        self.session.embryos = embryos;
    }

    /// Counts a transfer already committed in an earlier process run.
    pub(crate) fn replay_commit(&mut self, attempt: &TransferAttempt, entry: PoolEntry) {
        if self.session.committed_writes.contains(&attempt.id) {
            return;
        }
        let slot = self
            .session
            .tally
            .entry(attempt.recipient_id.clone())
            .or_default();
        slot.committed += 1;
        let embryos = slot.committed;
        self.session.committed_writes.push(attempt.id.clone());
        if let Some(link) = &attempt.protocol_link_id {
            if !self.session.touched_links.contains(link) {
                self.session.touched_links.push(link.clone());
            }
        }
        self.session.report.push(SessionReportItem {
            transfer_id: attempt.id.clone(),
            recipient_id: attempt.recipient_id.clone(),
            recipient_tag: entry.tag.clone(),
            embryo_id: attempt.embryo_id.clone(),
            embryo_label: attempt.embryo_id.to_string(),
            classification: None,
            protocol_link_id: attempt.protocol_link_id.clone(),
            transferred_on: attempt.transferred_on,
            kind: attempt.kind,
            veterinarian: attempt.veterinarian.clone(),
            technician: attempt.technician.clone(),
            notes: attempt.notes.clone(),
            embryo_number: embryos,
        });
        self.session.served.insert(attempt.recipient_id.clone(), entry);
        if self.session.phase == SessionPhase::Empty {
            self.session.phase = SessionPhase::Active;
        }
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        if self.session.phase == SessionPhase::Closed {
            return Err(TransferError::SessionClosed);
        }
        Ok(())
    }

    fn is_reserved(&self, embryo: &EmbryoId, except: Option<&str>) -> bool {
        self.session
            .pending
            .values()
            .chain(self.session.unsettled.values())
            .any(|ticket| &ticket.record.embryo_id == embryo && Some(ticket.key()) != except)
    }

    fn available_embryo(&self, embryo: &EmbryoId) -> Result<&Embryo, TransferError> {
        let reserved = self.is_reserved(embryo, None);
        self.session
            .embryos
            .iter()
            .find(|candidate| &candidate.id == embryo)
            .filter(|_| !reserved)
            .ok_or_else(|| TransferError::EmbryoUnavailable(embryo.clone()))
    }

    fn reserve(&mut self, pending: &PendingTransfer) {
        let recipient = pending.record.recipient_id.clone();
        self.session.tally.entry(recipient.clone()).or_default().pending += 1;
        self.session.unsettled.remove(pending.key());
        self.session
            .pending
            .insert(pending.key().to_string(), pending.clone());
        if self.session.selection.as_ref() == Some(&recipient) {
            self.session.selection = None;
        }
        self.session.phase = SessionPhase::Active;
        debug!(
            recipient = %recipient,
            embryo = %pending.record.embryo_id,
            key = pending.key(),
            "slot reserved"
        );
    }

    fn prune_slot(&mut self, recipient: &RecipientId) {
        if self.session.slot(recipient).total() == 0 {
            self.session.tally.remove(recipient);
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn report_item(pending: &PendingTransfer, transfer: &TransferId, embryos: u8) -> SessionReportItem {
    let record = &pending.record;
    SessionReportItem {
        transfer_id: transfer.clone(),
        recipient_id: record.recipient_id.clone(),
        recipient_tag: pending.recipient_tag.clone(),
        embryo_id: record.embryo_id.clone(),
        embryo_label: pending.embryo_label.clone(),
        classification: pending.classification.clone(),
        protocol_link_id: record.protocol_link_id.clone(),
        transferred_on: record.transferred_on,
        kind: record.kind,
        veterinarian: record.veterinarian.clone(),
        technician: record.technician.clone(),
        notes: record.notes.clone(),
        embryo_number: embryos,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{PackageId, ProtocolId};

    fn package() -> EmbryoSource {
        EmbryoSource::FreshPackage {
            package: PackageId::new("pkg-1"),
        }
    }

    fn entry(id: &str, status: Status) -> PoolEntry {
        PoolEntry {
            recipient_id: RecipientId::new(id),
            tag: id.to_uppercase(),
            origin: RecipientOrigin::Protocol {
                link: ProtocolLinkId::new(format!("pr-{id}")),
                protocol: ProtocolId::new("p-1"),
            },
            status,
        }
    }

    fn embryo(id: &str) -> Embryo {
        Embryo {
            id: EmbryoId::new(id),
            label: id.to_uppercase(),
            classification: Some("A".to_string()),
            package_id: Some(PackageId::new("pkg-1")),
            frozen: false,
            transferred: false,
        }
    }

    fn request(embryo: &str, recipient: &str) -> TransferRequest {
        TransferRequest {
            embryo_id: EmbryoId::new(embryo),
            recipient_id: RecipientId::new(recipient),
            transferred_on: NaiveDate::from_ymd_opt(2025, 4, 2).unwrap(),
            veterinarian: " Dr. Lima ".to_string(),
            technician: Some("  ".to_string()),
            notes: None,
        }
    }

    fn aggregator(allow_second: bool) -> TransferSessionAggregator {
        let mut aggregator =
            TransferSessionAggregator::new(FarmId::new("farm-1"), package(), allow_second);
        aggregator.replace_pool(vec![
            entry("r-1", Status::Synchronized),
            entry("r-2", Status::Synchronized),
            entry("r-3", Status::Served),
        ]);
        aggregator.replace_embryos(vec![embryo("e-1"), embryo("e-2"), embryo("e-3")]);
        aggregator
    }

    #[test]
    fn submit_reserves_before_commit() {
        let mut aggregator = aggregator(false);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        let recipient = RecipientId::new("r-1");

        assert_eq!(aggregator.session().phase(), SessionPhase::Active);
        assert_eq!(aggregator.session().slot(&recipient).pending, 1);
        assert!(aggregator.session().committed_writes().is_empty());
        assert_eq!(pending.record.veterinarian, "Dr. Lima");
        assert_eq!(pending.record.technician, None);
        assert_eq!(
            pending.record.protocol_link_id,
            Some(ProtocolLinkId::new("pr-r-1"))
        );

        let receipt = aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();
        assert_matches!(receipt, CommitReceipt::Committed { embryos: 1, .. });
        assert_eq!(aggregator.session().slot(&recipient).committed, 1);
        assert_eq!(aggregator.session().slot(&recipient).pending, 0);
        assert_eq!(aggregator.session().touched_links().len(), 1);
        assert!(
            aggregator
                .session()
                .embryos()
                .iter()
                .all(|e| e.id.as_str() != "e-1")
        );
    }

    #[test]
    fn third_submission_rejected_even_with_writes_in_flight() {
        let mut aggregator = aggregator(true);
        let first = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        let second = aggregator.submit_transfer(request("e-2", "r-1")).unwrap();
        let err = aggregator
            .submit_transfer(request("e-3", "r-1"))
            .unwrap_err();
        assert_matches!(err, TransferError::SlotLimitReached(_));

        aggregator
            .confirm_write(first.key(), TransferId::new("t-1"))
            .unwrap();
        aggregator
            .confirm_write(second.key(), TransferId::new("t-2"))
            .unwrap();
        let err = aggregator
            .submit_transfer(request("e-3", "r-1"))
            .unwrap_err();
        assert_matches!(err, TransferError::SlotLimitReached(_));
        assert_eq!(
            aggregator
                .session()
                .embryos_this_session(&RecipientId::new("r-1")),
            2
        );
    }

    #[test]
    fn second_embryo_needs_toggle() {
        let mut aggregator = aggregator(false);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();

        let visible = aggregator.visible_pool();
        assert!(visible.iter().all(|v| v.entry.recipient_id.as_str() != "r-1"));
        let err = aggregator
            .submit_transfer(request("e-2", "r-1"))
            .unwrap_err();
        assert_matches!(err, TransferError::RecipientNotInPool(_));

        aggregator.set_allow_second_embryo(true).unwrap();
        let visible = aggregator.visible_pool();
        let flagged = visible
            .iter()
            .find(|v| v.entry.recipient_id.as_str() == "r-1")
            .unwrap();
        assert!(flagged.second_embryo);
        aggregator.submit_transfer(request("e-2", "r-1")).unwrap();
    }

    #[test]
    fn second_embryo_skips_status_gate() {
        let mut aggregator = aggregator(true);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();
        // the store now reports the recipient as served
        aggregator.replace_pool(vec![entry("r-1", Status::Served)]);
        aggregator.submit_transfer(request("e-2", "r-1")).unwrap();
    }

    #[test]
    fn first_embryo_requires_synchronized() {
        let mut aggregator = aggregator(false);
        let err = aggregator
            .submit_transfer(request("e-1", "r-3"))
            .unwrap_err();
        assert_matches!(
            err,
            TransferError::TransitionDenied {
                actual: Status::Served,
                ..
            }
        );
        assert_eq!(aggregator.session().phase(), SessionPhase::Empty);
    }

    #[test]
    fn free_heat_recipient_passes_gate() {
        let mut aggregator = aggregator(false);
        aggregator.replace_pool(vec![PoolEntry {
            recipient_id: RecipientId::new("r-9"),
            tag: "R-9".to_string(),
            origin: RecipientOrigin::FreeHeat,
            status: Status::Empty,
        }]);
        let pending = aggregator.submit_transfer(request("e-1", "r-9")).unwrap();
        assert_eq!(pending.record.protocol_link_id, None);
    }

    #[test]
    fn blank_veterinarian_rejected() {
        let mut aggregator = aggregator(false);
        let mut req = request("e-1", "r-1");
        req.veterinarian = "   ".to_string();
        assert_matches!(
            aggregator.submit_transfer(req),
            Err(TransferError::MissingVeterinarian)
        );
    }

    #[test]
    fn embryo_reserved_by_pending_write_is_unavailable() {
        let mut aggregator = aggregator(false);
        aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        assert_matches!(
            aggregator.submit_transfer(request("e-1", "r-2")),
            Err(TransferError::EmbryoUnavailable(_))
        );
        assert_matches!(
            aggregator.submit_transfer(request("e-404", "r-2")),
            Err(TransferError::EmbryoUnavailable(_))
        );
    }

    #[test]
    fn reject_write_restores_pool_view() {
        let mut aggregator = aggregator(false);
        let before = aggregator.visible_pool();
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        assert_ne!(aggregator.visible_pool(), before);

        aggregator.reject_write(pending.key()).unwrap();
        assert_eq!(aggregator.visible_pool(), before);
        assert_eq!(
            aggregator
                .session()
                .embryos_this_session(&RecipientId::new("r-1")),
            0
        );
    }

    #[test]
    fn confirming_twice_does_not_double_count() {
        let mut aggregator = aggregator(true);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();
        let receipt = aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();
        assert_matches!(receipt, CommitReceipt::AlreadyCommitted(_));
        assert_eq!(aggregator.session().committed_writes().len(), 1);
        assert_matches!(
            aggregator.confirm_write("missing", TransferId::new("t-9")),
            Err(TransferError::UnknownWrite(_))
        );
    }

    #[test]
    fn discard_is_idempotent_and_clears_selection() {
        let mut aggregator = aggregator(false);
        let recipient = RecipientId::new("r-2");
        aggregator.select_recipient(&recipient).unwrap();

        let order = aggregator.discard_recipient(&recipient).unwrap();
        assert!(order.is_some());
        assert_eq!(aggregator.session().selection(), None);
        let once = aggregator.visible_pool();

        assert_eq!(aggregator.discard_recipient(&recipient).unwrap(), None);
        assert_eq!(aggregator.visible_pool(), once);

        aggregator.replace_pool(vec![entry("r-2", Status::Synchronized)]);
        assert!(aggregator.visible_pool().is_empty());
    }

    #[test]
    fn discard_unknown_or_served_recipient_fails() {
        let mut aggregator = aggregator(false);
        assert_matches!(
            aggregator.discard_recipient(&RecipientId::new("ghost")),
            Err(TransferError::UnknownRecipient(_))
        );
        aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        assert_matches!(
            aggregator.discard_recipient(&RecipientId::new("r-1")),
            Err(TransferError::RecipientAlreadyServed(_))
        );
    }

    #[test]
    fn close_requires_committed_write_and_no_pending() {
        let mut aggregator = aggregator(false);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        assert_matches!(aggregator.prepare_close(), Err(TransferError::EmptySession));
        aggregator.reject_write(pending.key()).unwrap();
        assert_matches!(aggregator.prepare_close(), Err(TransferError::EmptySession));
        assert_eq!(aggregator.session().phase(), SessionPhase::Active);

        let pending = aggregator.resubmit(&pending).unwrap();
        aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();
        aggregator.submit_transfer(request("e-2", "r-2")).unwrap();
        assert_matches!(
            aggregator.prepare_close(),
            Err(TransferError::WritesPending(1))
        );
    }

    #[test]
    fn closed_session_rejects_everything() {
        let mut aggregator = aggregator(false);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();
        let order = aggregator.prepare_close().unwrap();
        assert_eq!(order.recipients, vec![RecipientId::new("r-1")]);
        assert_eq!(order.links, vec![ProtocolLinkId::new("pr-r-1")]);

        let summary = aggregator.finish_close();
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.items[0].embryo_label, "E-1");
        assert_eq!(aggregator.session().phase(), SessionPhase::Closed);
        assert!(aggregator.session().committed_writes().is_empty());

        assert_matches!(
            aggregator.submit_transfer(request("e-2", "r-2")),
            Err(TransferError::SessionClosed)
        );
        assert_matches!(
            aggregator.select_recipient(&RecipientId::new("r-2")),
            Err(TransferError::SessionClosed)
        );
        assert_matches!(
            aggregator.discard_recipient(&RecipientId::new("r-2")),
            Err(TransferError::SessionClosed)
        );
        assert_matches!(aggregator.prepare_close(), Err(TransferError::SessionClosed));
        assert_matches!(
            aggregator.set_allow_second_embryo(true),
            Err(TransferError::SessionClosed)
        );
        assert!(!aggregator.session().allow_second_embryo());
    }

    #[test]
    fn repeated_submit_reuses_unsettled_ticket() {
        let mut aggregator = aggregator(false);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        let ticket = aggregator.reject_write(pending.key()).unwrap();
        aggregator.hold_unsettled(ticket);

        // the held ticket keeps its embryo and its slot
        assert_matches!(
            aggregator.submit_transfer(request("e-1", "r-2")),
            Err(TransferError::EmbryoUnavailable(_))
        );
        assert_matches!(
            aggregator.discard_recipient(&RecipientId::new("r-1")),
            Err(TransferError::RecipientAlreadyServed(_))
        );

        let snapshot = aggregator.session().snapshot();
        assert_eq!(snapshot.unsettled.len(), 1);
        let json = serde_json::to_string(&snapshot).unwrap();
        let mut restored = TransferSessionAggregator::from_snapshot(serde_json::from_str(&json).unwrap());
        restored.replace_pool(vec![entry("r-1", Status::Synchronized)]);
        restored.replace_embryos(vec![embryo("e-1")]);

        let mut again = request("e-1", "r-1");
        again.notes = Some("second try".to_string());
        let retry = restored.submit_transfer(again).unwrap();
        assert_eq!(retry.key(), pending.key());
        assert_eq!(retry.record.notes, None);
        assert_eq!(restored.session().unsettled_writes().count(), 0);
        assert_eq!(restored.session().slot(&RecipientId::new("r-1")).pending, 1);
    }

    #[test]
    fn commit_for_recipient_outside_pool_still_marks_served() {
        let mut aggregator = aggregator(true);
        let pending = aggregator.submit_transfer(request("e-1", "r-1")).unwrap();
        // the store stopped offering r-1 before the write was confirmed
        aggregator.replace_pool(vec![entry("r-2", Status::Synchronized)]);
        aggregator
            .confirm_write(pending.key(), TransferId::new("t-1"))
            .unwrap();

        aggregator.replace_pool(vec![entry("r-2", Status::Synchronized)]);
        let flagged = aggregator
            .visible_pool()
            .into_iter()
            .find(|v| v.entry.recipient_id.as_str() == "r-1")
            .unwrap();
        assert!(flagged.second_embryo);
        assert_eq!(flagged.entry.tag, "R-1");
        assert_eq!(
            aggregator
                .session()
                .committed_transfer(&EmbryoId::new("e-1"), &RecipientId::new("r-1")),
            Some(&TransferId::new("t-1"))
        );
    }
}
