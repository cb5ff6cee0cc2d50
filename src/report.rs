use chrono::NaiveDate;
use serde::Serialize;

use crate::domain::{
    EmbryoId, EmbryoSource, FarmId, ProtocolLinkId, RecipientId, TransferId, TransferKind,
};
use crate::session::SessionPhase;

/// One committed transfer, as listed in the end-of-session report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReportItem {
    pub transfer_id: TransferId,
    pub recipient_id: RecipientId,
    pub recipient_tag: String,
    pub embryo_id: EmbryoId,
    pub embryo_label: String,
    pub classification: Option<String>,
    pub protocol_link_id: Option<ProtocolLinkId>,
    pub transferred_on: NaiveDate,
    pub kind: TransferKind,
    pub veterinarian: String,
    pub technician: Option<String>,
    pub notes: Option<String>,
    /// 1 for the first embryo the recipient received in the session, 2 for
    /// the second.
    pub embryo_number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub farm_id: FarmId,
    pub source: EmbryoSource,
    pub phase: SessionPhase,
    pub committed: usize,
    pub pending: usize,
    pub recipients_served: usize,
    pub discarded: Vec<RecipientId>,
    pub items: Vec<SessionReportItem>,
}

impl SessionSummary {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items for one recipient, in commit order.
    pub fn items_for<'a>(
        &'a self,
        recipient: &'a RecipientId,
    ) -> impl Iterator<Item = &'a SessionReportItem> + 'a {
        self.items
            .iter()
            .filter(move |item| &item.recipient_id == recipient)
    }
}
