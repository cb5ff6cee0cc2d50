use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::domain::{EmbryoId, ProtocolId, RecipientId, Status};
use crate::transition::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Transient,
    Local,
}

#[derive(Debug, Error, Diagnostic)]
pub enum TransferError {
    #[error("{action} requires status {required}; current status is {actual}")]
    TransitionDenied {
        action: Action,
        required: String,
        actual: Status,
    },

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("recipient not found: {0}")]
    UnknownRecipient(RecipientId),

    #[error("recipient {0} is not available in the current pool")]
    RecipientNotInPool(RecipientId),

    #[error("recipient {0} already received the maximum of 2 embryos in this session")]
    SlotLimitReached(RecipientId),

    #[error("recipient {0} received an embryo in this session and cannot be discarded")]
    RecipientAlreadyServed(RecipientId),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("embryo {0} is not available for transfer")]
    EmbryoUnavailable(EmbryoId),

    #[error("responsible veterinarian is required")]
    MissingVeterinarian,

    #[error("no transfers committed in this session")]
    EmptySession,

    #[error("{0} transfer write(s) still awaiting confirmation")]
    WritesPending(usize),

    #[error("session is closed; start a new session")]
    SessionClosed,

    #[error("no open transfer session")]
    #[diagnostic(help("start one with `kira-tm session open <farm>`"))]
    NoOpenSession,

    #[error("session {0} is still open; close it before opening another")]
    SessionInProgress(String),

    #[error("no pending write with key {0}")]
    UnknownWrite(String),

    #[error("embryo {0} was already transferred")]
    Conflict(EmbryoId),

    #[error("record store unavailable: {0}")]
    #[diagnostic(help("the operation was rolled back and can be retried"))]
    StoreUnavailable(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to parse data file {path}: {message}")]
    DataParse { path: Utf8PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::TransitionDenied { .. }
            | TransferError::UnknownAction(_)
            | TransferError::InvalidIdentifier(_)
            | TransferError::InvalidStatus(_)
            | TransferError::UnknownRecipient(_)
            | TransferError::RecipientNotInPool(_)
            | TransferError::SlotLimitReached(_)
            | TransferError::RecipientAlreadyServed(_)
            | TransferError::RecordNotFound(_)
            | TransferError::EmbryoUnavailable(_)
            | TransferError::MissingVeterinarian
            | TransferError::EmptySession
            | TransferError::WritesPending(_)
            | TransferError::SessionClosed
            | TransferError::NoOpenSession
            | TransferError::SessionInProgress(_)
            | TransferError::UnknownWrite(_) => ErrorKind::Validation,
            TransferError::Conflict(_) => ErrorKind::Conflict,
            TransferError::StoreUnavailable(_) => ErrorKind::Transient,
            TransferError::ConfigRead(_)
            | TransferError::ConfigParse(_)
            | TransferError::DataParse { .. }
            | TransferError::Filesystem(_) => ErrorKind::Local,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Problems found while deriving a status from history. These never abort a
/// lookup: the resolver falls back to `EMPTY` and reports the warning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationWarning {
    #[error("recipient {0} not found in store")]
    RecipientMissing(RecipientId),

    #[error("lookup failed for recipient {recipient}: {message}")]
    LookupFailed {
        recipient: RecipientId,
        message: String,
    },

    #[error("enrollment of recipient {recipient} references unknown protocol {protocol}")]
    UnknownProtocol {
        recipient: RecipientId,
        protocol: ProtocolId,
    },
}
