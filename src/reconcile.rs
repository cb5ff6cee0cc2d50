use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{
    EmbryoId, EmbryoSource, FarmId, LinkStatus, ProtocolEnrollment, RecipientId,
    RecipientOrigin, Status, TransferAttempt, TransferId,
};
use crate::error::TransferError;
use crate::report::SessionSummary;
use crate::session::{
    CommitReceipt, PendingTransfer, PoolEntry, SessionPhase, SessionSnapshot,
    TransferSessionAggregator,
};
use crate::status::BatchStatusResolver;
use crate::store::RecordStore;

pub const DISCARD_REASON: &str = "discarded during embryo transfer; no embryo received";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WriteResult {
    Committed { transfer: TransferId, embryos: u8 },
    AlreadyCommitted { transfer: TransferId },
    /// The store already holds a transfer for this embryo. Not a failure:
    /// the local embryo pool was refreshed.
    Duplicate { embryo: EmbryoId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiscardOutcome {
    /// False when the recipient was already discarded in this session.
    pub newly_discarded: bool,
    /// False when the recipient's status could not be reset to empty yet.
    /// Discarding again repeats the reset.
    pub status_reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedSession {
    pub summary: SessionSummary,
    /// Farm candidates as the store sees them after the close; `None` if the
    /// refresh failed.
    pub pool: Option<Vec<PoolEntry>>,
}

/// Applies durable-write outcomes to a session and keeps its views in step
/// with the store.
pub struct SessionReconciler<'a, S: RecordStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RecordStore + ?Sized> SessionReconciler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub fn open(
        &self,
        farm: FarmId,
        source: EmbryoSource,
        allow_second_embryo: bool,
    ) -> Result<TransferSessionAggregator, TransferError> {
        let mut aggregator = TransferSessionAggregator::new(farm, source, allow_second_embryo);
        self.refresh_pool(&mut aggregator)?;
        self.refresh_embryos(&mut aggregator)?;
        info!(
            session = %aggregator.session().id(),
            farm = %aggregator.session().farm_id(),
            "session opened"
        );
        Ok(aggregator)
    }

    /// Rebuilds a persisted session, replaying its committed transfers from
    /// the store to recover per-recipient counts.
    pub fn restore(
        &self,
        snapshot: SessionSnapshot,
    ) -> Result<TransferSessionAggregator, TransferError> {
        let committed = snapshot.committed_writes.clone();
        let mut aggregator = TransferSessionAggregator::from_snapshot(snapshot);
        if aggregator.session().phase() == SessionPhase::Closed {
            return Ok(aggregator);
        }

        if !committed.is_empty() {
            let attempts = self
                .store
                .fetch_transfer_attempts(&committed)?
                .into_iter()
                .map(|attempt| (attempt.id.clone(), attempt))
                .collect::<HashMap<_, _>>();
            let recipient_ids = attempts
                .values()
                .map(|a| a.recipient_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();
            let tags = self
                .store
                .fetch_recipients(&recipient_ids)?
                .into_iter()
                .map(|r| (r.id, r.tag))
                .collect::<HashMap<_, _>>();
            let links = self
                .store
                .fetch_protocol_enrollments(&recipient_ids)?
                .into_iter()
                .map(|link| (link.id.clone(), link))
                .collect::<HashMap<_, _>>();

            for id in &committed {
                let Some(attempt) = attempts.get(id) else {
                    warn!(transfer = %id, "committed transfer missing from store; not counted");
                    continue;
                };
                let origin = match attempt
                    .protocol_link_id
                    .as_ref()
                    .and_then(|link| links.get(link))
                {
                    Some(link) => RecipientOrigin::Protocol {
                        link: link.id.clone(),
                        protocol: link.protocol_id.clone(),
                    },
                    None => RecipientOrigin::FreeHeat,
                };
                let entry = PoolEntry {
                    recipient_id: attempt.recipient_id.clone(),
                    tag: tags
                        .get(&attempt.recipient_id)
                        .cloned()
                        .unwrap_or_else(|| attempt.recipient_id.to_string()),
                    origin,
                    status: Status::Served,
                };
                aggregator.replay_commit(attempt, entry);
            }
        }

        self.refresh_pool(&mut aggregator)?;
        self.settle(&mut aggregator)?;
        self.refresh_embryos(&mut aggregator)?;
        Ok(aggregator)
    }

    /// Looks up every unsettled write in the store. A write that landed is
    /// counted; one the store never recorded is forgotten.
    pub fn settle(&self, aggregator: &mut TransferSessionAggregator) -> Result<(), TransferError> {
        let tickets = aggregator
            .session()
            .unsettled_writes()
            .cloned()
            .collect::<Vec<_>>();
        for ticket in tickets {
            match self.store.fetch_embryo_transfer(&ticket.record.embryo_id)? {
                Some(existing) if is_own_write(&existing, &ticket) => {
                    let retry = aggregator.resubmit(&ticket)?;
                    self.reconcile(aggregator, &retry, Ok(existing.id))?;
                }
                _ => {
                    aggregator.drop_unsettled(ticket.key());
                    debug!(key = ticket.key(), "unsettled write never recorded; dropped");
                }
            }
        }
        Ok(())
    }

    /// Sends the reserved write to the store and reconciles the result.
    pub fn write(
        &self,
        aggregator: &mut TransferSessionAggregator,
        pending: &PendingTransfer,
    ) -> Result<WriteResult, TransferError> {
        let result = self.store.write_transfer_attempt(&pending.record);
        self.reconcile(aggregator, pending, result)
    }

    /// Settles a reservation from the outcome of its durable write. Success
    /// commits the slot. A duplicate-embryo conflict rolls it back quietly,
    /// unless the transfer on record is this same transfer; then it commits.
    /// Any other failure rolls it back, keeps the ticket for a retry and is
    /// returned to the caller.
    pub fn reconcile(
        &self,
        aggregator: &mut TransferSessionAggregator,
        pending: &PendingTransfer,
        result: Result<TransferId, TransferError>,
    ) -> Result<WriteResult, TransferError> {
        match result {
            Ok(transfer) => match aggregator.confirm_write(pending.key(), transfer)? {
                CommitReceipt::Committed { transfer, embryos } => {
                    if let Err(err) = self.store.mark_embryo_transferred(&pending.record.embryo_id)
                    {
                        warn!(
                            embryo = %pending.record.embryo_id,
                            error = %err,
                            "failed to mark embryo as transferred"
                        );
                    }
                    self.refresh_pool_or_keep(aggregator);
                    Ok(WriteResult::Committed { transfer, embryos })
                }
                CommitReceipt::AlreadyCommitted(transfer) => {
                    Ok(WriteResult::AlreadyCommitted { transfer })
                }
            },
            Err(TransferError::Conflict(embryo)) => {
                let existing = match self.store.fetch_embryo_transfer(&embryo) {
                    Ok(existing) => existing,
                    Err(err) => return self.roll_back(aggregator, pending, err),
                };
                if let Some(existing) = existing.filter(|a| is_own_write(a, pending)) {
                    debug!(transfer = %existing.id, "conflicting transfer is this one; confirming");
                    return self.reconcile(aggregator, pending, Ok(existing.id));
                }
                aggregator.reject_write(pending.key())?;
                debug!(embryo = %embryo, "embryo already transferred; refreshing embryo pool");
                if let Err(err) = self.refresh_embryos(aggregator) {
                    warn!(error = %err, "embryo pool refresh failed");
                }
                Ok(WriteResult::Duplicate { embryo })
            }
            Err(err) => self.roll_back(aggregator, pending, err),
        }
    }

    fn roll_back(
        &self,
        aggregator: &mut TransferSessionAggregator,
        pending: &PendingTransfer,
        err: TransferError,
    ) -> Result<WriteResult, TransferError> {
        let ticket = aggregator.reject_write(pending.key())?;
        if err.is_retryable() {
            aggregator.hold_unsettled(ticket);
        }
        warn!(
            recipient = %pending.record.recipient_id,
            embryo = %pending.record.embryo_id,
            error = %err,
            "transfer write rejected"
        );
        Err(err)
    }

    /// Discards a recipient and records it downstream: the protocol link
    /// becomes unfit (or the free-heat entry is cancelled), then the recipient
    /// goes back to empty.
    ///
    /// The link update takes the recipient out of the store's pool, so its
    /// failure undoes the local discard. Once it succeeded the discard
    /// stands; a failed status reset is reported in the outcome and repeated
    /// by the next discard of the same recipient.
    pub fn discard(
        &self,
        aggregator: &mut TransferSessionAggregator,
        recipient: &RecipientId,
    ) -> Result<DiscardOutcome, TransferError> {
        let newly_discarded = match aggregator.discard_recipient(recipient)? {
            Some(order) => {
                let removed = match &order.entry.origin {
                    RecipientOrigin::Protocol { link, .. } => self.store.update_protocol_link_status(
                        link,
                        LinkStatus::Unfit,
                        Some(DISCARD_REASON),
                    ),
                    RecipientOrigin::FreeHeat => self.store.discard_free_heat(recipient),
                };
                if let Err(err) = removed {
                    aggregator.undo_discard(&order);
                    warn!(recipient = %recipient, error = %err, "discard not recorded; restored to pool");
                    return Err(err);
                }
                true
            }
            None => false,
        };

        let status_reset = match self.store.update_recipient_status(recipient, Status::Empty) {
            Ok(()) => true,
            Err(err) => {
                warn!(recipient = %recipient, error = %err, "recipient status not reset after discard");
                false
            }
        };
        Ok(DiscardOutcome {
            newly_discarded,
            status_reset,
        })
    }

    /// Closes the session in the store, then locally. The session stays
    /// active if the store rejects the close.
    pub fn close(
        &self,
        aggregator: &mut TransferSessionAggregator,
    ) -> Result<ClosedSession, TransferError> {
        self.settle(aggregator)?;
        let order = aggregator.prepare_close()?;
        self.store
            .close_transfer_session(&order.recipients, &order.links)?;
        let farm = aggregator.session().farm_id().clone();
        let summary = aggregator.finish_close();

        let pool = match self.load_pool(&farm) {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(farm = %farm, error = %err, "pool refresh after close failed");
                None
            }
        };
        Ok(ClosedSession { summary, pool })
    }

    pub fn refresh_pool(
        &self,
        aggregator: &mut TransferSessionAggregator,
    ) -> Result<(), TransferError> {
        let pool = self.load_pool(aggregator.session().farm_id())?;
        aggregator.replace_pool(pool);
        Ok(())
    }

    pub fn refresh_embryos(
        &self,
        aggregator: &mut TransferSessionAggregator,
    ) -> Result<(), TransferError> {
        let embryos = self
            .store
            .fetch_available_embryos(aggregator.session().source())?;
        aggregator.replace_embryos(embryos);
        Ok(())
    }

    /// Candidates on a farm: synchronized recipients holding a ready protocol
    /// link, plus recipients flagged in free heat.
    pub fn load_pool(&self, farm: &FarmId) -> Result<Vec<PoolEntry>, TransferError> {
        let recipients = self.store.fetch_farm_recipients(farm)?;
        let free_heat = self
            .store
            .fetch_free_heat_recipients(farm)?
            .into_iter()
            .collect::<BTreeSet<_>>();
        let ids = recipients
            .iter()
            .map(|r| r.id.clone())
            .collect::<BTreeSet<_>>();
        let statuses = BatchStatusResolver::new(self.store).resolve_many(&ids);
        let ids = ids.into_iter().collect::<Vec<_>>();
        let ready_links = ready_links(self.store.fetch_protocol_enrollments(&ids)?);

        let mut pool = recipients
            .into_iter()
            .filter_map(|recipient| {
                let status = statuses
                    .get(&recipient.id)
                    .copied()
                    .unwrap_or(Status::Empty);
                let origin = match ready_links.get(&recipient.id) {
                    Some(link) if status == Status::Synchronized => RecipientOrigin::Protocol {
                        link: link.id.clone(),
                        protocol: link.protocol_id.clone(),
                    },
                    _ if free_heat.contains(&recipient.id) => RecipientOrigin::FreeHeat,
                    _ => return None,
                };
                Some(PoolEntry {
                    recipient_id: recipient.id,
                    tag: recipient.tag,
                    origin,
                    status,
                })
            })
            .collect::<Vec<_>>();
        pool.sort_by(|a, b| a.tag.cmp(&b.tag));
        debug!(farm = %farm, candidates = pool.len(), "pool loaded");
        Ok(pool)
    }

    fn refresh_pool_or_keep(&self, aggregator: &mut TransferSessionAggregator) {
        if let Err(err) = self.refresh_pool(aggregator) {
            warn!(error = %err, "pool refresh failed; keeping previous view");
        }
    }
}

/// A transfer on record for the ticket's embryo is the ticket's own write when
/// it carries the same write key, or was made to the same recipient on the
/// same farm.
fn is_own_write(existing: &TransferAttempt, ticket: &PendingTransfer) -> bool {
    let record = &ticket.record;
    existing.write_key.as_deref() == Some(record.write_key.as_str())
        || (existing.recipient_id == record.recipient_id && existing.farm_id == record.farm_id)
}

/// Last ready link per recipient.
fn ready_links(enrollments: Vec<ProtocolEnrollment>) -> BTreeMap<RecipientId, ProtocolEnrollment> {
    enrollments
        .into_iter()
        .filter(|link| link.status == LinkStatus::Ready)
        .map(|link| (link.recipient_id.clone(), link))
        .collect()
}
