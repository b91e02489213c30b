//! Startup recovery: replay or cancel this instance's in-progress transactions

use crate::metrics::record_transition;
use crate::repository::in_progress_filter;
use crate::{CoordinatorError, Service, Transaction, TransactionId, TransactionModel, TransactionStatus};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of a startup load
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Replayed to completion
    pub replayed: Vec<TransactionId>,
    /// Recorded under a different operation fingerprint; marked `CANCELED`
    pub canceled: Vec<TransactionId>,
    /// Replay failed and was skipped (only when not aborting on replay errors)
    pub skipped: Vec<TransactionId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.replayed.is_empty() && self.canceled.is_empty() && self.skipped.is_empty()
    }
}

impl Service {
    /// Re-drive every transaction this instance left `IN_PROGRESS` for this
    /// operation.
    ///
    /// Rows whose fingerprint differs from the current configuration are
    /// canceled in one batch update and never replayed. Matching rows are
    /// rebuilt from their raw message with the current builders and run
    /// through begin/exec/commit under their original ID. A failed replay is
    /// persisted as `FAILED` whatever the failure policy, so each row is
    /// attempted at most once. Runs once, before message consumption starts.
    pub async fn load_on_startup(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RecoveryReport, CoordinatorError> {
        let filter = in_progress_filter(self.config.instance_id, &self.operation.name);
        let rows = self
            .system
            .repository
            .get_all_transactions_by_fields(&filter)
            .await?;

        let mut report = RecoveryReport::default();
        if rows.is_empty() {
            info!(operation = %self.operation.name, "No transactions to recover");
            return Ok(report);
        }
        info!(operation = %self.operation.name, count = rows.len(), "Recovering in-progress transactions");

        let (matching, drifted): (Vec<_>, Vec<_>) = rows
            .into_iter()
            .partition(|row| row.operation_hash == self.operation_hash.as_bytes());

        if !drifted.is_empty() {
            let ids: Vec<String> = drifted.iter().map(|row| row.id.clone()).collect();
            self.system
                .repository
                .update_status_many(&ids, TransactionStatus::Canceled, &self.config.recovery.cancel_reason)
                .await?;
            for row in &drifted {
                self.metrics.add_total_transactions();
                self.metrics.add_in_progress_transactions();
                record_transition(self.metrics.as_ref(), TransactionStatus::InProgress, TransactionStatus::Canceled);
                report.canceled.push(row.transaction_id()?);
            }
            warn!(count = ids.len(), "Canceled transactions recorded under a different configuration");
        }

        for row in matching {
            let tx_id = row.transaction_id()?;
            match self.replay(cancel, &row).await {
                Ok(()) => report.replayed.push(tx_id),
                Err(e) if self.config.recovery.abort_on_replay_error => {
                    error!(tx_id = %tx_id, error = %e, "Replay failed, aborting recovery");
                    return Err(CoordinatorError::Replay {
                        tx_id,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(tx_id = %tx_id, error = %e, "Replay failed, skipping");
                    report.skipped.push(tx_id);
                }
            }
        }

        info!(
            replayed = report.replayed.len(),
            canceled = report.canceled.len(),
            skipped = report.skipped.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    async fn replay(
        &self,
        cancel: &CancellationToken,
        row: &TransactionModel,
    ) -> Result<(), CoordinatorError> {
        let mut tx = match self.rebuild(row) {
            Ok(tx) => tx,
            Err(e) => {
                // Never drivable; retire it so later loads skip it.
                self.system
                    .repository
                    .update_status_many(
                        std::slice::from_ref(&row.id),
                        TransactionStatus::Failed,
                        &e.to_string(),
                    )
                    .await?;
                return Err(e);
            }
        };
        self.metrics.add_total_transactions();
        self.metrics.add_in_progress_transactions();
        self.track(&tx);
        info!(tx_id = %tx.id(), "Replaying transaction");
        self.drive(cancel, &mut tx).await
    }

    fn rebuild(&self, row: &TransactionModel) -> Result<Transaction, CoordinatorError> {
        let raw = row.raw()?;
        let requests = self.build_requests(&raw)?;
        Transaction::rehydrate(row.transaction_id()?, requests, raw, self.header(), row.created_at)
    }
}
