use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::domain::Status;
use crate::error::TransferError;

/// State-changing actions on a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    EnterStep1,
    FinishStep1,
    FinishStep2,
    PerformTransfer,
    PerformDiagnosis,
    PerformSexing,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::EnterStep1,
        Action::FinishStep1,
        Action::FinishStep2,
        Action::PerformTransfer,
        Action::PerformDiagnosis,
        Action::PerformSexing,
    ];

    /// Statuses from which the action may start.
    pub fn required_statuses(self) -> &'static [Status] {
        match self {
            Action::EnterStep1 | Action::FinishStep1 => &[Status::Empty],
            Action::FinishStep2 => &[Status::Synchronizing],
            Action::PerformTransfer => &[Status::Synchronized],
            Action::PerformDiagnosis => &[Status::Served],
            Action::PerformSexing => &[Status::Pregnant, Status::PregnantRetouch],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::EnterStep1 => "ENTER_STEP1",
            Action::FinishStep1 => "FINISH_STEP1",
            Action::FinishStep2 => "FINISH_STEP2",
            Action::PerformTransfer => "PERFORM_TRANSFER",
            Action::PerformDiagnosis => "PERFORM_DIAGNOSIS",
            Action::PerformSexing => "PERFORM_SEXING",
        }
    }

    fn required_label(self) -> String {
        self.required_statuses()
            .iter()
            .map(|status| status.as_str())
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = TransferError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace('-', "_");
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
            .ok_or_else(|| TransferError::UnknownAction(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

pub fn validate(current: Status, action: Action) -> Verdict {
    match check(current, action) {
        Ok(()) => Verdict::allow(),
        Err(err) => Verdict::deny(err.to_string()),
    }
}

/// Same as [`validate`] for an action given by name. Unknown names are denied.
pub fn validate_named(current: Status, action: &str) -> Verdict {
    match action.parse::<Action>() {
        Ok(action) => validate(current, action),
        Err(err) => Verdict::deny(err.to_string()),
    }
}

pub fn check(current: Status, action: Action) -> Result<(), TransferError> {
    if action.required_statuses().contains(&current) {
        return Ok(());
    }
    Err(TransferError::TransitionDenied {
        action,
        required: action.required_label(),
        actual: current,
    })
}
