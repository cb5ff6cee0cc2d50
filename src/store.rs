use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use uuid::Uuid;

use crate::domain::{
    Diagnosis, Embryo, EmbryoId, EmbryoSource, FarmId, LinkStatus, ProtocolEnrollment, ProtocolId,
    ProtocolLinkId, ProtocolStatus, Recipient, RecipientId, Status, TransferAttempt, TransferId,
    TransferKind,
};
use crate::error::TransferError;

/// Transfer record as sent for a durable write. `write_key` identifies the
/// client-side attempt so a retried write is recognized by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransferAttempt {
    pub write_key: String,
    pub embryo_id: EmbryoId,
    pub recipient_id: RecipientId,
    pub protocol_link_id: Option<ProtocolLinkId>,
    pub farm_id: FarmId,
    pub transferred_on: NaiveDate,
    pub kind: TransferKind,
    pub veterinarian: String,
    pub technician: Option<String>,
    pub notes: Option<String>,
}

/// Persistence collaborator. Implementations are shared with other sessions
/// and devices, so any call may observe concurrent changes.
pub trait RecordStore: Send + Sync {
    fn fetch_recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, TransferError>;
    fn fetch_recipients(&self, ids: &[RecipientId]) -> Result<Vec<Recipient>, TransferError>;
    fn fetch_farm_recipients(&self, farm: &FarmId) -> Result<Vec<Recipient>, TransferError>;
    fn fetch_free_heat_recipients(&self, farm: &FarmId) -> Result<Vec<RecipientId>, TransferError>;

    /// Most recent attempt by transfer date, with its latest diagnosis applied.
    fn fetch_latest_transfer_attempt(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<TransferAttempt>, TransferError>;
    fn fetch_latest_transfer_attempts(
        &self,
        recipients: &[RecipientId],
    ) -> Result<HashMap<RecipientId, TransferAttempt>, TransferError>;
    fn fetch_transfer_attempts(
        &self,
        ids: &[TransferId],
    ) -> Result<Vec<TransferAttempt>, TransferError>;

    fn fetch_protocol_enrollments(
        &self,
        recipients: &[RecipientId],
    ) -> Result<Vec<ProtocolEnrollment>, TransferError>;
    fn fetch_protocol_statuses(
        &self,
        protocols: &[ProtocolId],
    ) -> Result<HashMap<ProtocolId, ProtocolStatus>, TransferError>;

    /// Embryos the source offers that have no transfer on record.
    fn fetch_available_embryos(&self, source: &EmbryoSource)
    -> Result<Vec<Embryo>, TransferError>;
    fn fetch_embryo_transfer(
        &self,
        embryo: &EmbryoId,
    ) -> Result<Option<TransferAttempt>, TransferError>;

    /// Fails with [`TransferError::Conflict`] when the embryo already has a
    /// transfer on record.
    fn write_transfer_attempt(
        &self,
        record: &NewTransferAttempt,
    ) -> Result<TransferId, TransferError>;
    fn mark_embryo_transferred(&self, embryo: &EmbryoId) -> Result<(), TransferError>;
    fn update_recipient_status(
        &self,
        recipient: &RecipientId,
        status: Status,
    ) -> Result<(), TransferError>;
    fn update_protocol_link_status(
        &self,
        link: &ProtocolLinkId,
        status: LinkStatus,
        reason: Option<&str>,
    ) -> Result<(), TransferError>;
    fn discard_free_heat(&self, recipient: &RecipientId) -> Result<(), TransferError>;

    /// Bulk transition at the end of a session: links become used and the
    /// recipients served.
    fn close_transfer_session(
        &self,
        recipients: &[RecipientId],
        links: &[ProtocolLinkId],
    ) -> Result<(), TransferError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    pub id: ProtocolId,
    pub status: ProtocolStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeHeatEntry {
    pub recipient_id: RecipientId,
    pub farm_id: FarmId,
    #[serde(default)]
    pub discarded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub protocols: Vec<ProtocolRecord>,
    #[serde(default)]
    pub enrollments: Vec<ProtocolEnrollment>,
    #[serde(default)]
    pub attempts: Vec<TransferAttempt>,
    #[serde(default)]
    pub diagnoses: Vec<Diagnosis>,
    #[serde(default)]
    pub embryos: Vec<Embryo>,
    #[serde(default)]
    pub free_heat: Vec<FreeHeatEntry>,
}

impl Dataset {
    fn latest_attempt(&self, recipient: &RecipientId) -> Option<TransferAttempt> {
        self.attempts
            .iter()
            .enumerate()
            .filter(|(_, attempt)| &attempt.recipient_id == recipient)
            .max_by_key(|(index, attempt)| (attempt.transferred_on, *index))
            .map(|(_, attempt)| self.with_diagnosis(attempt))
    }

    fn with_diagnosis(&self, attempt: &TransferAttempt) -> TransferAttempt {
        let latest = self
            .diagnoses
            .iter()
            .enumerate()
            .filter(|(_, diagnosis)| diagnosis.attempt_id == attempt.id)
            .max_by_key(|(index, diagnosis)| (diagnosis.examined_on, *index))
            .map(|(_, diagnosis)| diagnosis.outcome);
        let mut attempt = attempt.clone();
        if latest.is_some() {
            attempt.outcome = latest;
        }
        attempt
    }
}

/// In-process [`RecordStore`] over a [`Dataset`], optionally loaded from and
/// saved to a JSON file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<Dataset>,
}

impl MemoryStore {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            data: Mutex::new(dataset),
        }
    }

    /// Loads the dataset at `path`; a missing file is an empty dataset.
    pub fn open(path: &Utf8Path) -> Result<Self, TransferError> {
        if !path.as_std_path().exists() {
            return Ok(Self::default());
        }
        Ok(Self::new(read_json(path)?))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), TransferError> {
        let data = self.data()?;
        write_json_atomic(path, &*data)
    }

    pub fn snapshot(&self) -> Result<Dataset, TransferError> {
        Ok(self.data()?.clone())
    }

    pub fn record_diagnosis(&self, diagnosis: Diagnosis) -> Result<(), TransferError> {
        let mut data = self.data()?;
        if !data
            .attempts
            .iter()
            .any(|attempt| attempt.id == diagnosis.attempt_id)
        {
            return Err(TransferError::RecordNotFound(format!(
                "transfer {}",
                diagnosis.attempt_id
            )));
        }
        data.diagnoses.push(diagnosis);
        Ok(())
    }

    fn data(&self) -> Result<MutexGuard<'_, Dataset>, TransferError> {
        self.data
            .lock()
            .map_err(|_| TransferError::StoreUnavailable("store lock poisoned".to_string()))
    }
}

impl RecordStore for MemoryStore {
    fn fetch_recipient(&self, id: &RecipientId) -> Result<Option<Recipient>, TransferError> {
        let data = self.data()?;
        Ok(data.recipients.iter().find(|r| &r.id == id).cloned())
    }

    fn fetch_recipients(&self, ids: &[RecipientId]) -> Result<Vec<Recipient>, TransferError> {
        let wanted = ids.iter().collect::<HashSet<_>>();
        let data = self.data()?;
        Ok(data
            .recipients
            .iter()
            .filter(|r| wanted.contains(&r.id))
            .cloned()
            .collect())
    }

    fn fetch_farm_recipients(&self, farm: &FarmId) -> Result<Vec<Recipient>, TransferError> {
        let data = self.data()?;
        Ok(data
            .recipients
            .iter()
            .filter(|r| &r.farm_id == farm)
            .cloned()
            .collect())
    }

    fn fetch_free_heat_recipients(&self, farm: &FarmId) -> Result<Vec<RecipientId>, TransferError> {
        let data = self.data()?;
        Ok(data
            .free_heat
            .iter()
            .filter(|entry| &entry.farm_id == farm && !entry.discarded)
            .map(|entry| entry.recipient_id.clone())
            .collect())
    }

    fn fetch_latest_transfer_attempt(
        &self,
        recipient: &RecipientId,
    ) -> Result<Option<TransferAttempt>, TransferError> {
        Ok(self.data()?.latest_attempt(recipient))
    }

    fn fetch_latest_transfer_attempts(
        &self,
        recipients: &[RecipientId],
    ) -> Result<HashMap<RecipientId, TransferAttempt>, TransferError> {
        let data = self.data()?;
        Ok(recipients
            .iter()
            .filter_map(|id| data.latest_attempt(id).map(|attempt| (id.clone(), attempt)))
            .collect())
    }

    fn fetch_transfer_attempts(
        &self,
        ids: &[TransferId],
    ) -> Result<Vec<TransferAttempt>, TransferError> {
        let wanted = ids.iter().collect::<HashSet<_>>();
        let data = self.data()?;
        Ok(data
            .attempts
            .iter()
            .filter(|attempt| wanted.contains(&attempt.id))
            .map(|attempt| data.with_diagnosis(attempt))
            .collect())
    }

    fn fetch_protocol_enrollments(
        &self,
        recipients: &[RecipientId],
    ) -> Result<Vec<ProtocolEnrollment>, TransferError> {
        let wanted = recipients.iter().collect::<HashSet<_>>();
        let data = self.data()?;
        Ok(data
            .enrollments
            .iter()
            .filter(|link| wanted.contains(&link.recipient_id))
            .cloned()
            .collect())
    }

    fn fetch_protocol_statuses(
        &self,
        protocols: &[ProtocolId],
    ) -> Result<HashMap<ProtocolId, ProtocolStatus>, TransferError> {
        let wanted = protocols.iter().collect::<HashSet<_>>();
        let data = self.data()?;
        Ok(data
            .protocols
            .iter()
            .filter(|protocol| wanted.contains(&protocol.id))
            .map(|protocol| (protocol.id.clone(), protocol.status))
            .collect())
    }

    fn fetch_available_embryos(
        &self,
        source: &EmbryoSource,
    ) -> Result<Vec<Embryo>, TransferError> {
        let data = self.data()?;
        let attempted = data
            .attempts
            .iter()
            .map(|attempt| &attempt.embryo_id)
            .collect::<HashSet<_>>();
        Ok(data
            .embryos
            .iter()
            .filter(|embryo| source.provides(embryo) && !attempted.contains(&embryo.id))
            .cloned()
            .collect())
    }

    fn fetch_embryo_transfer(
        &self,
        embryo: &EmbryoId,
    ) -> Result<Option<TransferAttempt>, TransferError> {
        let data = self.data()?;
        Ok(data
            .attempts
            .iter()
            .find(|attempt| &attempt.embryo_id == embryo)
            .map(|attempt| data.with_diagnosis(attempt)))
    }

    fn write_transfer_attempt(
        &self,
        record: &NewTransferAttempt,
    ) -> Result<TransferId, TransferError> {
        let mut data = self.data()?;
        if let Some(existing) = data
            .attempts
            .iter()
            .find(|attempt| attempt.write_key.as_deref() == Some(record.write_key.as_str()))
        {
            return Ok(existing.id.clone());
        }
        if data
            .attempts
            .iter()
            .any(|attempt| attempt.embryo_id == record.embryo_id)
        {
            return Err(TransferError::Conflict(record.embryo_id.clone()));
        }
        if !data.recipients.iter().any(|r| r.id == record.recipient_id) {
            return Err(TransferError::UnknownRecipient(record.recipient_id.clone()));
        }

        let id = TransferId::new(Uuid::new_v4().to_string());
        data.attempts.push(TransferAttempt {
            id: id.clone(),
            embryo_id: record.embryo_id.clone(),
            recipient_id: record.recipient_id.clone(),
            protocol_link_id: record.protocol_link_id.clone(),
            farm_id: record.farm_id.clone(),
            transferred_on: record.transferred_on,
            kind: record.kind,
            veterinarian: record.veterinarian.clone(),
            technician: record.technician.clone(),
            notes: record.notes.clone(),
            outcome: None,
            write_key: Some(record.write_key.clone()),
        });
        Ok(id)
    }

    fn mark_embryo_transferred(&self, embryo: &EmbryoId) -> Result<(), TransferError> {
        let mut data = self.data()?;
        let entry = data
            .embryos
            .iter_mut()
            .find(|e| &e.id == embryo)
            .ok_or_else(|| TransferError::RecordNotFound(format!("embryo {embryo}")))?;
        entry.transferred = true;
        Ok(())
    }

    fn update_recipient_status(
        &self,
        recipient: &RecipientId,
        status: Status,
    ) -> Result<(), TransferError> {
        let mut data = self.data()?;
        let entry = data
            .recipients
            .iter_mut()
            .find(|r| &r.id == recipient)
            .ok_or_else(|| TransferError::UnknownRecipient(recipient.clone()))?;
        entry.stored_status = Some(status);
        Ok(())
    }

    fn update_protocol_link_status(
        &self,
        link: &ProtocolLinkId,
        status: LinkStatus,
        reason: Option<&str>,
    ) -> Result<(), TransferError> {
        let mut data = self.data()?;
        let entry = data
            .enrollments
            .iter_mut()
            .find(|l| &l.id == link)
            .ok_or_else(|| TransferError::RecordNotFound(format!("protocol link {link}")))?;
        entry.status = status;
        if let Some(reason) = reason {
            entry.unfit_reason = Some(reason.to_string());
        }
        Ok(())
    }

    fn discard_free_heat(&self, recipient: &RecipientId) -> Result<(), TransferError> {
        let mut data = self.data()?;
        for entry in data
            .free_heat
            .iter_mut()
            .filter(|entry| &entry.recipient_id == recipient)
        {
            entry.discarded = true;
        }
        Ok(())
    }

    fn close_transfer_session(
        &self,
        recipients: &[RecipientId],
        links: &[ProtocolLinkId],
    ) -> Result<(), TransferError> {
        let mut data = self.data()?;
        for link in data.enrollments.iter_mut().filter(|l| links.contains(&l.id)) {
            link.status = LinkStatus::Used;
        }
        for recipient in data
            .recipients
            .iter_mut()
            .filter(|r| recipients.contains(&r.id))
        {
            recipient.stored_status = Some(Status::Served);
        }
        Ok(())
    }
}

/// Project-local layout: `.kira-tm/` holds the dataset and the open session.
/// Closed-session reports go to a per-user directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: Utf8PathBuf,
    reports_root: Utf8PathBuf,
}

impl Workspace {
    pub fn new() -> Result<Self, TransferError> {
        let cwd = std::env::current_dir().map_err(|err| TransferError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".kira-tm"))
            .map_err(|_| TransferError::Filesystem("invalid project path".to_string()))?;

        let reports_root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(
                    dirs.data_local_dir()
                        .join("kira-transfer-manager")
                        .join("reports"),
                )
                .ok()
            })
            .ok_or_else(|| {
                TransferError::Filesystem("unable to resolve reports directory".to_string())
            })?;

        Ok(Self { root, reports_root })
    }

    pub fn new_with_paths(root: Utf8PathBuf, reports_root: Utf8PathBuf) -> Self {
        Self { root, reports_root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn reports_root(&self) -> &Utf8Path {
        &self.reports_root
    }

    pub fn default_data_path(&self) -> Utf8PathBuf {
        self.root.join("data.json")
    }

    pub fn session_path(&self) -> Utf8PathBuf {
        self.root.join("session.json")
    }

    pub fn report_path(&self, session_id: &str) -> Utf8PathBuf {
        self.reports_root.join(format!("{session_id}.json"))
    }

    pub fn clear_session(&self) -> Result<(), TransferError> {
        let path = self.session_path();
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| TransferError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, TransferError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| TransferError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| TransferError::DataParse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Utf8Path,
    value: &T,
) -> Result<(), TransferError> {
    let parent = path
        .parent()
        .ok_or_else(|| TransferError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| TransferError::Filesystem(err.to_string()))?;
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| TransferError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("kira-tm")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| TransferError::Filesystem(err.to_string()))?;
    temp.write_all(&content)
        .map_err(|err| TransferError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| TransferError::Filesystem(err.to_string()))?;
    Ok(())
}
