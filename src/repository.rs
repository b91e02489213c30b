//! System-store read path

use crate::{Arg, InstanceId, TransactionModel, TransactionStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Column filters combined with AND; values compare by equality
pub type Fields = BTreeMap<String, Arg>;

/// Columns a filter may reference
pub const FILTER_COLUMNS: &[&str] = &["id", "status", "instance_id", "operation_type", "failed_driver"];

/// Read/update access to `transactions.transactions`
#[async_trait]
pub trait TransactionRepository: Send + Sync + 'static {
    /// Rows whose columns equal every value in `fields`
    async fn get_all_transactions_by_fields(
        &self,
        fields: &Fields,
    ) -> Result<Vec<TransactionModel>, RepositoryError>;

    /// Number of rows `get_all_transactions_by_fields` would return
    async fn get_count_transactions_by_fields(&self, fields: &Fields) -> Result<usize, RepositoryError>;

    /// Set `status` (and `error = reason`) on every row in `ids`
    async fn update_status_many(
        &self,
        ids: &[String],
        status: TransactionStatus,
        reason: &str,
    ) -> Result<(), RepositoryError>;
}

/// System-store read or update failure
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Storage error: {0}")]
    Storage(Box<str>),
    #[error("Decode error: {0}")]
    Decode(Box<str>),
    #[error("Unknown filter column: {0}")]
    UnknownColumn(Box<str>),
}

/// Filter selecting this instance's in-progress rows for one operation
pub fn in_progress_filter(instance_id: InstanceId, operation: &str) -> Fields {
    Fields::from([
        ("status".to_string(), Arg::Text(TransactionStatus::InProgress.as_str().to_string())),
        ("instance_id".to_string(), Arg::Int(instance_id.0 as i64)),
        ("operation_type".to_string(), Arg::Text(operation.to_string())),
    ])
}

pub(crate) fn check_filter(fields: &Fields) -> Result<(), RepositoryError> {
    match fields.keys().find(|k| !FILTER_COLUMNS.contains(&k.as_str())) {
        Some(column) => Err(RepositoryError::UnknownColumn(column.as_str().into())),
        None => Ok(()),
    }
}
