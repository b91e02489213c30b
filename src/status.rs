//! Transaction status and role

use serde::{Deserialize, Serialize};

/// Lifecycle status of a transaction.
///
/// `InProgress` is the only non-terminal state; no transition leaves a
/// terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    InProgress,
    Success,
    Failed,
    Canceled,
}

impl TransactionStatus {
    /// Persisted string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Parse the persisted string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a transaction writes.
///
/// Both roles run the same begin/exec/commit protocol. A system transaction
/// writes bookkeeping rows about its parent into the system store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionRole {
    /// Applies user data from an inbound message
    User,
    /// Persists bookkeeping for the user transaction `parent`
    System {
        /// The user transaction being recorded
        parent: crate::TransactionId,
    },
}

impl TransactionRole {
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }
}
