use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TransferError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(TransferError::InvalidIdentifier(value.to_string()));
                }
                Ok(Self(trimmed.to_string()))
            }
        }
    };
}

string_id!(RecipientId);
string_id!(EmbryoId);
string_id!(FarmId);
string_id!(ProtocolId);
string_id!(ProtocolLinkId);
string_id!(TransferId);
string_id!(PackageId);

/// Reproductive stage of a recipient. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Empty,
    Synchronizing,
    Synchronized,
    Served,
    Pregnant,
    PregnantRetouch,
    PregnantFemale,
    PregnantMale,
    PregnantUnsexed,
    PregnantTwoSexes,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Empty,
        Status::Synchronizing,
        Status::Synchronized,
        Status::Served,
        Status::Pregnant,
        Status::PregnantRetouch,
        Status::PregnantFemale,
        Status::PregnantMale,
        Status::PregnantUnsexed,
        Status::PregnantTwoSexes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Empty => "EMPTY",
            Status::Synchronizing => "SYNCHRONIZING",
            Status::Synchronized => "SYNCHRONIZED",
            Status::Served => "SERVED",
            Status::Pregnant => "PREGNANT",
            Status::PregnantRetouch => "PREGNANT_RETOUCH",
            Status::PregnantFemale => "PREGNANT_FEMALE",
            Status::PregnantMale => "PREGNANT_MALE",
            Status::PregnantUnsexed => "PREGNANT_UNSEXED",
            Status::PregnantTwoSexes => "PREGNANT_TWO_SEXES",
        }
    }

    pub fn is_pregnant(self) -> bool {
        matches!(
            self,
            Status::Pregnant
                | Status::PregnantRetouch
                | Status::PregnantFemale
                | Status::PregnantMale
                | Status::PregnantUnsexed
                | Status::PregnantTwoSexes
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = TransferError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| TransferError::InvalidStatus(value.to_string()))
    }
}

/// Result recorded against a transfer attempt, either directly or by a later
/// diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pregnant,
    PregnantFemale,
    PregnantMale,
    PregnantUnsexed,
    PregnantTwoSexes,
    Empty,
    Retouch,
    NoDiagnosisYet,
}

impl Outcome {
    /// Status implied by the outcome of a recipient's latest attempt.
    ///
    /// `Retouch` and `NoDiagnosisYet` both land on `Served`, so a recipient
    /// waiting for a repeat attempt is indistinguishable from one waiting for
    /// her first diagnosis. Kept as-is; records that need the distinction
    /// carry an explicit stored status.
    pub fn status(self) -> Status {
        match self {
            Outcome::PregnantFemale => Status::PregnantFemale,
            Outcome::PregnantMale => Status::PregnantMale,
            Outcome::PregnantUnsexed => Status::PregnantUnsexed,
            Outcome::PregnantTwoSexes => Status::PregnantTwoSexes,
            Outcome::Pregnant => Status::Pregnant,
            Outcome::Empty => Status::Empty,
            Outcome::Retouch => Status::Served,
            Outcome::NoDiagnosisYet => Status::Served,
        }
    }
}

/// Sub-status of a recipient's link to a synchronization protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Active,
    Ready,
    Unfit,
    Used,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolStatus {
    Open,
    Step1Closed,
    Step2Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub tag: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub stored_status: Option<Status>,
    pub farm_id: FarmId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEnrollment {
    pub id: ProtocolLinkId,
    pub recipient_id: RecipientId,
    pub protocol_id: ProtocolId,
    pub status: LinkStatus,
    #[serde(default)]
    pub unfit_reason: Option<String>,
}

impl ProtocolEnrollment {
    /// Active means the protocol has not finished step 2 and the recipient is
    /// still in it.
    pub fn is_active(&self, protocol: ProtocolStatus) -> bool {
        protocol != ProtocolStatus::Step2Closed
            && matches!(self.status, LinkStatus::Active | LinkStatus::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferKind {
    Fresh,
    Frozen,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Fresh => write!(f, "FRESH"),
            TransferKind::Frozen => write!(f, "FROZEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAttempt {
    pub id: TransferId,
    pub embryo_id: EmbryoId,
    pub recipient_id: RecipientId,
    #[serde(default)]
    pub protocol_link_id: Option<ProtocolLinkId>,
    pub farm_id: FarmId,
    pub transferred_on: NaiveDate,
    pub kind: TransferKind,
    pub veterinarian: String,
    #[serde(default)]
    pub technician: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub write_key: Option<String>,
}

impl TransferAttempt {
    /// A pending attempt has no diagnosis yet.
    pub fn effective_outcome(&self) -> Outcome {
        self.outcome.unwrap_or(Outcome::NoDiagnosisYet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub attempt_id: TransferId,
    pub examined_on: NaiveDate,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embryo {
    pub id: EmbryoId,
    pub label: String,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub package_id: Option<PackageId>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub transferred: bool,
}

/// Where the embryos of a session come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbryoSource {
    FreshPackage { package: PackageId },
    Frozen,
}

impl EmbryoSource {
    pub fn transfer_kind(&self) -> TransferKind {
        match self {
            EmbryoSource::FreshPackage { .. } => TransferKind::Fresh,
            EmbryoSource::Frozen => TransferKind::Frozen,
        }
    }

    pub fn provides(&self, embryo: &Embryo) -> bool {
        if embryo.transferred {
            return false;
        }
        match self {
            EmbryoSource::FreshPackage { package } => {
                !embryo.frozen && embryo.package_id.as_ref() == Some(package)
            }
            EmbryoSource::Frozen => embryo.frozen,
        }
    }
}

/// How a recipient entered the transfer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecipientOrigin {
    Protocol {
        link: ProtocolLinkId,
        protocol: ProtocolId,
    },
    FreeHeat,
}

impl RecipientOrigin {
    pub fn protocol_link(&self) -> Option<&ProtocolLinkId> {
        match self {
            RecipientOrigin::Protocol { link, .. } => Some(link),
            RecipientOrigin::FreeHeat => None,
        }
    }
}
