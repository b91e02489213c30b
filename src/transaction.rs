//! The transaction entity: one identity, status and outcome over a set of
//! per-driver requests

use crate::{
    CoordinatorError, Driver, DriverId, InstanceId, OperationHash, RawMessage, Request,
    TransactionId, TransactionRole, TransactionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One driver's share of a transaction
#[derive(Clone)]
pub struct Participant {
    pub driver: Arc<dyn Driver>,
    pub request: Request,
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("driver", &self.driver.id())
            .field("request", &self.request)
            .finish()
    }
}

/// The unit of atomicity.
///
/// Status starts `InProgress` and moves to exactly one terminal state.
/// `failed_driver` and `error` are set together, once, and only on the move
/// to `Failed`. The participant set is fixed at construction.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    role: TransactionRole,
    status: TransactionStatus,
    participants: BTreeMap<DriverId, Participant>,
    failed_driver: Option<DriverId>,
    error: Option<Box<str>>,
    instance_id: InstanceId,
    operation_hash: OperationHash,
    operation: Box<str>,
    raw: RawMessage,
    created_at: DateTime<Utc>,
    replay: bool,
}

/// Point-in-time copy of a transaction's bookkeeping, without drivers
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionSnapshot {
    pub id: TransactionId,
    pub role: TransactionRole,
    pub status: TransactionStatus,
    pub drivers: Vec<DriverId>,
    pub failed_driver: Option<DriverId>,
    pub error: Option<Box<str>>,
    pub created_at: DateTime<Utc>,
}

/// Inputs shared by every transaction built for one operation
#[derive(Clone, Debug)]
pub struct TransactionHeader {
    pub instance_id: InstanceId,
    pub operation_hash: OperationHash,
    pub operation: Box<str>,
}

impl Transaction {
    /// Create a user transaction with a fresh ID
    pub fn new(
        requests: Vec<(Arc<dyn Driver>, Request)>,
        raw: RawMessage,
        header: TransactionHeader,
    ) -> Result<Self, CoordinatorError> {
        Self::build(TransactionId::new(), TransactionRole::User, requests, raw, header, Utc::now())
    }

    /// Rebuild a persisted user transaction under its original ID
    pub fn rehydrate(
        id: TransactionId,
        requests: Vec<(Arc<dyn Driver>, Request)>,
        raw: RawMessage,
        header: TransactionHeader,
        created_at: DateTime<Utc>,
    ) -> Result<Self, CoordinatorError> {
        let mut tx = Self::build(id, TransactionRole::User, requests, raw, header, created_at)?;
        tx.replay = true;
        Ok(tx)
    }

    /// Create a bookkeeping transaction writing about `parent`
    pub fn system(
        parent: &Transaction,
        driver: Arc<dyn Driver>,
        request: Request,
    ) -> Result<Self, CoordinatorError> {
        let header = TransactionHeader {
            instance_id: parent.instance_id,
            operation_hash: parent.operation_hash.clone(),
            operation: parent.operation.clone(),
        };
        let raw = request.raw.clone();
        Self::build(
            TransactionId::new(),
            TransactionRole::System { parent: parent.id },
            vec![(driver, request)],
            raw,
            header,
            Utc::now(),
        )
    }

    fn build(
        id: TransactionId,
        role: TransactionRole,
        requests: Vec<(Arc<dyn Driver>, Request)>,
        raw: RawMessage,
        header: TransactionHeader,
        created_at: DateTime<Utc>,
    ) -> Result<Self, CoordinatorError> {
        if requests.is_empty() {
            return Err(CoordinatorError::EmptyTransaction);
        }
        if header.operation_hash.is_empty() {
            return Err(CoordinatorError::Config(crate::ConfigError::MissingOption(
                "operation hash".into(),
            )));
        }

        let mut participants = BTreeMap::new();
        for (driver, request) in requests {
            let driver_id = driver.id();
            if participants.contains_key(&driver_id) {
                return Err(CoordinatorError::Config(crate::ConfigError::DuplicateDriver(
                    driver_id.name,
                )));
            }
            participants.insert(driver_id, Participant { driver, request });
        }

        Ok(Self {
            id,
            role,
            status: TransactionStatus::InProgress,
            participants,
            failed_driver: None,
            error: None,
            instance_id: header.instance_id,
            operation_hash: header.operation_hash,
            operation: header.operation,
            raw,
            created_at,
            replay: false,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn role(&self) -> TransactionRole {
        self.role
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn failed_driver(&self) -> Option<&DriverId> {
        self.failed_driver.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn operation_hash(&self) -> &OperationHash {
        &self.operation_hash
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn raw(&self) -> &RawMessage {
        &self.raw
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Rebuilt from the system store by recovery
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn driver_ids(&self) -> impl Iterator<Item = &DriverId> {
        self.participants.keys()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Participants to roll back: everyone except the failed driver
    pub fn rollback_targets(&self) -> impl Iterator<Item = &Participant> {
        let failed = self.failed_driver.as_ref();
        self.participants
            .iter()
            .filter(move |(id, _)| Some(*id) != failed)
            .map(|(_, p)| p)
    }

    /// Record the first failure.
    ///
    /// Returns `false` (and changes nothing) if the transaction already left
    /// `InProgress`.
    pub fn mark_failed(&mut self, driver: &DriverId, error: &str) -> bool {
        if self.status != TransactionStatus::InProgress {
            return false;
        }
        self.status = TransactionStatus::Failed;
        self.failed_driver = Some(driver.clone());
        self.error = Some(error.into());
        true
    }

    /// Move to `Success`; requires `InProgress`
    pub fn mark_success(&mut self) -> Result<(), CoordinatorError> {
        self.transition(TransactionStatus::Success)
    }

    /// Move to `Canceled`; requires `InProgress`
    pub fn mark_canceled(&mut self, reason: &str) -> Result<(), CoordinatorError> {
        self.transition(TransactionStatus::Canceled)?;
        self.error = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, to: TransactionStatus) -> Result<(), CoordinatorError> {
        self.require(TransactionStatus::InProgress)?;
        self.status = to;
        Ok(())
    }

    /// Fail with `InvalidStatus` unless the transaction is in `expected`
    pub fn require(&self, expected: TransactionStatus) -> Result<(), CoordinatorError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidStatus {
                tx_id: self.id,
                expected,
                actual: self.status,
            })
        }
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            id: self.id,
            role: self.role,
            status: self.status,
            drivers: self.participants.keys().cloned().collect(),
            failed_driver: self.failed_driver.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
        }
    }
}
