use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{Embryo, EmbryoId, EmbryoSource, FarmId, RecipientId, Status};
use crate::error::TransferError;
use crate::reconcile::{ClosedSession, SessionReconciler, WriteResult};
use crate::report::SessionSummary;
use crate::session::{
    SessionPhase, SessionSnapshot, TransferRequest, TransferSessionAggregator, VisibleRecipient,
};
use crate::status::{BatchStatusResolver, StatusResolver, StatusSource};
use crate::store::{RecordStore, Workspace, read_json, write_json_atomic};
use crate::transition::{self, Verdict};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub recipients: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub recipient_id: RecipientId,
    pub status: Status,
    pub source: StatusSource,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: Status,
    pub action: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolView {
    pub session_id: String,
    pub farm_id: FarmId,
    pub source: EmbryoSource,
    pub phase: SessionPhase,
    pub allow_second_embryo: bool,
    pub selection: Option<RecipientId>,
    pub recipients: Vec<VisibleRecipient>,
    pub embryos: Vec<Embryo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub recipient_id: RecipientId,
    pub embryo_id: EmbryoId,
    pub result: WriteResult,
    pub embryos_this_session: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscardResult {
    pub recipient_id: RecipientId,
    pub discarded: bool,
    pub status_reset: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseResult {
    #[serde(flatten)]
    pub closed: ClosedSession,
    pub report_path: Option<String>,
}

/// Command surface over one record store and the project workspace. Each
/// session command restores the open session, applies one change and saves
/// it again.
pub struct App<S: RecordStore> {
    store: S,
    workspace: Workspace,
}

impl<S: RecordStore> App<S> {
    pub fn new(store: S, workspace: Workspace) -> Self {
        Self { store, workspace }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn status(&self, ids: &[RecipientId]) -> StatusReport {
        let resolutions = match ids {
            [id] => vec![(id.clone(), StatusResolver::new(&self.store).resolve_detailed(id))],
            _ => {
                let ids = ids.iter().cloned().collect::<BTreeSet<_>>();
                BatchStatusResolver::new(&self.store)
                    .resolve_many_detailed(&ids)
                    .into_iter()
                    .collect()
            }
        };
        StatusReport {
            recipients: resolutions
                .into_iter()
                .map(|(recipient_id, resolution)| StatusEntry {
                    recipient_id,
                    status: resolution.status,
                    source: resolution.source,
                    warnings: resolution.warnings.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        }
    }

    pub fn check(&self, status: Status, action: &str) -> CheckResult {
        CheckResult {
            status,
            action: action.trim().to_string(),
            verdict: transition::validate_named(status, action.trim()),
        }
    }

    pub fn open_session(
        &self,
        farm: FarmId,
        source: EmbryoSource,
        allow_second_embryo: bool,
    ) -> Result<PoolView, TransferError> {
        if let Some(snapshot) = self.load_snapshot()? {
            if snapshot.phase != SessionPhase::Closed {
                return Err(TransferError::SessionInProgress(
                    snapshot.session_id.to_string(),
                ));
            }
        }
        let aggregator = self.reconciler().open(farm, source, allow_second_embryo)?;
        self.save_session(&aggregator)?;
        Ok(pool_view(&aggregator))
    }

    pub fn pool(&self) -> Result<PoolView, TransferError> {
        let aggregator = self.restore()?;
        Ok(pool_view(&aggregator))
    }

    pub fn select(&self, recipient: &RecipientId) -> Result<PoolView, TransferError> {
        let mut aggregator = self.restore()?;
        aggregator.select_recipient(recipient)?;
        self.save_session(&aggregator)?;
        Ok(pool_view(&aggregator))
    }

    pub fn set_second_embryo(&self, allow: bool) -> Result<PoolView, TransferError> {
        let mut aggregator = self.restore()?;
        aggregator.set_allow_second_embryo(allow)?;
        self.save_session(&aggregator)?;
        Ok(pool_view(&aggregator))
    }

    pub fn transfer(&self, request: TransferRequest) -> Result<TransferResult, TransferError> {
        let mut aggregator = self.restore()?;
        let recipient_id = request.recipient_id.clone();
        let embryo_id = request.embryo_id.clone();

        let result = match aggregator
            .session()
            .committed_transfer(&embryo_id, &recipient_id)
            .cloned()
        {
            // repeated transfer, already counted
            Some(transfer) => WriteResult::AlreadyCommitted { transfer },
            None => {
                let pending = aggregator.submit_transfer(request)?;
                let result = self.reconciler().write(&mut aggregator, &pending);
                self.save_session(&aggregator)?;
                result?
            }
        };

        Ok(TransferResult {
            embryos_this_session: aggregator.session().embryos_this_session(&recipient_id),
            recipient_id,
            embryo_id,
            result,
        })
    }

    pub fn discard(&self, recipient: &RecipientId) -> Result<DiscardResult, TransferError> {
        let mut aggregator = self.restore()?;
        let outcome = self.reconciler().discard(&mut aggregator, recipient)?;
        self.save_session(&aggregator)?;
        Ok(DiscardResult {
            recipient_id: recipient.clone(),
            discarded: true,
            status_reset: outcome.status_reset,
        })
    }

    pub fn summary(&self) -> Result<SessionSummary, TransferError> {
        Ok(self.restore()?.session().summary())
    }

    /// Closes the open session and archives its report. A report that cannot
    /// be written does not undo the close.
    pub fn close(&self) -> Result<CloseResult, TransferError> {
        let mut aggregator = self.restore()?;
        let closed = self.reconciler().close(&mut aggregator)?;
        self.workspace.clear_session()?;

        let path = self.workspace.report_path(&closed.summary.session_id);
        let report_path = match write_json_atomic(&path, &closed.summary) {
            Ok(()) => {
                info!(session = %closed.summary.session_id, path = %path, "session report archived");
                Some(path.to_string())
            }
            Err(err) => {
                warn!(path = %path, error = %err, "session report not archived");
                None
            }
        };
        Ok(CloseResult {
            closed,
            report_path,
        })
    }

    fn reconciler(&self) -> SessionReconciler<'_, S> {
        SessionReconciler::new(&self.store)
    }

    fn restore(&self) -> Result<TransferSessionAggregator, TransferError> {
        let snapshot = self.load_snapshot()?.ok_or(TransferError::NoOpenSession)?;
        if snapshot.phase == SessionPhase::Closed {
            return Err(TransferError::NoOpenSession);
        }
        let unsettled = snapshot.unsettled.len();
        let aggregator = self.reconciler().restore(snapshot)?;
        // restoring settles held writes against the store
        if unsettled > 0 {
            self.save_session(&aggregator)?;
        }
        Ok(aggregator)
    }

    fn load_snapshot(&self) -> Result<Option<SessionSnapshot>, TransferError> {
        let path = self.workspace.session_path();
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn save_session(&self, aggregator: &TransferSessionAggregator) -> Result<(), TransferError> {
        write_json_atomic(
            &self.workspace.session_path(),
            &aggregator.session().snapshot(),
        )
    }
}

fn pool_view(aggregator: &TransferSessionAggregator) -> PoolView {
    let session = aggregator.session();
    PoolView {
        session_id: session.id().to_string(),
        farm_id: session.farm_id().clone(),
        source: session.source().clone(),
        phase: session.phase(),
        allow_second_embryo: session.allow_second_embryo(),
        selection: session.selection().cloned(),
        recipients: aggregator.visible_pool(),
        embryos: session.embryos().to_vec(),
    }
}
