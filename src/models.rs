//! Durable projection of transactions into the system store
//!
//! ```sql
//! transactions.transactions (id, status, data, error, instance_id,
//!                            failed_driver, operation_hash, operation_type, created_at)
//! transactions.requests     (id, tx_id, driver_type, driver_name, created_at)
//! ```

use crate::{
    Arg, CoordinatorError, InstanceId, OperationHash, OperationKind, RawMessage, RequestSpec,
    Transaction, TransactionId, TransactionStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Table holding one row per transaction
pub const TRANSACTIONS_TABLE: &str = "transactions.transactions";
/// Table holding one row per participating driver
pub const REQUESTS_TABLE: &str = "transactions.requests";

/// Row of `transactions.transactions`.
///
/// `operation_type` holds the name of the configured operation that produced
/// the transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionModel {
    pub id: String,
    pub status: String,
    pub data: String,
    pub error: Option<String>,
    pub instance_id: i32,
    pub failed_driver: Option<String>,
    pub operation_hash: Vec<u8>,
    pub operation_type: String,
    pub created_at: DateTime<Utc>,
}

impl TransactionModel {
    pub fn from_transaction(tx: &Transaction) -> Result<Self, CoordinatorError> {
        let data = serde_json::to_string(tx.raw())
            .map_err(|e| CoordinatorError::Decode(e.to_string().into()))?;
        Ok(Self {
            id: tx.id().to_string(),
            status: tx.status().as_str().to_string(),
            data,
            error: tx.error().map(str::to_string),
            instance_id: tx.instance_id().0,
            failed_driver: tx.failed_driver().map(|d| d.name.to_string()),
            operation_hash: tx.operation_hash().as_bytes().to_vec(),
            operation_type: tx.operation().to_string(),
            created_at: tx.created_at(),
        })
    }

    pub fn transaction_id(&self) -> Result<TransactionId, CoordinatorError> {
        TransactionId::parse(&self.id)
            .map_err(|e| CoordinatorError::Decode(format!("transaction id {:?}: {}", self.id, e).into()))
    }

    pub fn status(&self) -> Result<TransactionStatus, CoordinatorError> {
        TransactionStatus::parse(&self.status)
            .ok_or_else(|| CoordinatorError::Decode(format!("status {:?}", self.status).into()))
    }

    pub fn instance(&self) -> InstanceId {
        InstanceId(self.instance_id)
    }

    pub fn hash(&self) -> OperationHash {
        OperationHash(self.operation_hash.clone())
    }

    /// Decode the persisted raw message
    pub fn raw(&self) -> Result<RawMessage, CoordinatorError> {
        serde_json::from_str(&self.data)
            .map_err(|e| CoordinatorError::Decode(format!("data of {}: {}", self.id, e).into()))
    }

    /// Insert statement for this row
    pub fn insert_spec(&self) -> RequestSpec {
        let mut spec = RequestSpec::new(TRANSACTIONS_TABLE, OperationKind::Create);
        spec.values = self.columns();
        spec
    }

    /// Status/outcome update statement for this row
    pub fn status_update_spec(&self) -> RequestSpec {
        RequestSpec::new(TRANSACTIONS_TABLE, OperationKind::Update)
            .with_value("id", Arg::Text(self.id.clone()))
            .with_value("status", Arg::Text(self.status.clone()))
            .with_value("error", opt_text(&self.error))
            .with_value("failed_driver", opt_text(&self.failed_driver))
    }

    /// Every column as a statement argument
    pub fn columns(&self) -> BTreeMap<String, Arg> {
        BTreeMap::from([
            ("id".to_string(), Arg::Text(self.id.clone())),
            ("status".to_string(), Arg::Text(self.status.clone())),
            ("data".to_string(), Arg::Text(self.data.clone())),
            ("error".to_string(), opt_text(&self.error)),
            ("instance_id".to_string(), Arg::Int(self.instance_id as i64)),
            ("failed_driver".to_string(), opt_text(&self.failed_driver)),
            ("operation_hash".to_string(), Arg::Bytes(self.operation_hash.clone())),
            ("operation_type".to_string(), Arg::Text(self.operation_type.clone())),
            ("created_at".to_string(), Arg::Timestamp(self.created_at)),
        ])
    }

    /// Decode a row previously written by `columns`
    pub fn from_columns(row: &BTreeMap<String, Arg>) -> Result<Self, CoordinatorError> {
        let text = |name: &str| -> Result<String, CoordinatorError> {
            row.get(name)
                .and_then(Arg::as_str)
                .map(str::to_string)
                .ok_or_else(|| CoordinatorError::Decode(format!("column {}", name).into()))
        };
        let opt = |name: &str| row.get(name).and_then(Arg::as_str).map(str::to_string);

        let instance_id = row
            .get("instance_id")
            .and_then(Arg::as_i64)
            .ok_or_else(|| CoordinatorError::Decode("column instance_id".into()))?;
        let operation_hash = row
            .get("operation_hash")
            .and_then(Arg::as_bytes)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| CoordinatorError::Decode("column operation_hash".into()))?;
        let created_at = match row.get("created_at") {
            Some(Arg::Timestamp(ts)) => *ts,
            _ => return Err(CoordinatorError::Decode("column created_at".into())),
        };

        Ok(Self {
            id: text("id")?,
            status: text("status")?,
            data: text("data")?,
            error: opt("error"),
            instance_id: instance_id as i32,
            failed_driver: opt("failed_driver"),
            operation_hash,
            operation_type: text("operation_type")?,
            created_at,
        })
    }
}

/// Row of `transactions.requests`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestModel {
    pub id: Uuid,
    pub tx_id: String,
    pub driver_type: String,
    pub driver_name: String,
    pub created_at: DateTime<Utc>,
}

impl RequestModel {
    /// One row per participating driver of `tx`
    pub fn for_transaction(tx: &Transaction) -> Vec<Self> {
        let now = Utc::now();
        tx.driver_ids()
            .map(|driver| Self {
                id: Uuid::new_v4(),
                tx_id: tx.id().to_string(),
                driver_type: driver.storage_type.as_str().to_string(),
                driver_name: driver.name.to_string(),
                created_at: now,
            })
            .collect()
    }

    pub fn insert_spec(&self) -> RequestSpec {
        RequestSpec::new(REQUESTS_TABLE, OperationKind::Create)
            .with_value("id", Arg::Text(self.id.to_string()))
            .with_value("tx_id", Arg::Text(self.tx_id.clone()))
            .with_value("driver_type", Arg::Text(self.driver_type.clone()))
            .with_value("driver_name", Arg::Text(self.driver_name.clone()))
            .with_value("created_at", Arg::Timestamp(self.created_at))
    }
}

fn opt_text(value: &Option<String>) -> Arg {
    value.as_ref().map_or(Arg::Null, |s| Arg::Text(s.clone()))
}
