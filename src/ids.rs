//! Transaction identity types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a transaction, passed to every driver call
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Generate a fresh random transaction ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a persisted transaction ID
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Get the raw UUID
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process instance that owns a transaction.
///
/// Recovery only replays rows carrying this process's instance ID, so
/// horizontally scaled instances never touch each other's in-flight work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub i32);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_parse() {
        let id = TransactionId::new();
        let parsed = TransactionId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(TransactionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }
}
