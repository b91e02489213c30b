//! Unit-of-Work coordinator: drives begin/exec/commit/rollback across the
//! drivers of a transaction and records every transaction in the system store
//! through the same protocol.

use crate::metrics::record_transition;
use crate::{
    ConfigError, CoordinatorError, Driver, DriverError, DriverId, DriverSet, FailurePolicy,
    InMemoryRegistry, MetricsCounter, NoOpMetrics, OperationConfig, OperationHash, Phase,
    RawMessage, Request, RequestBuilder, RequestModel, RequestSpec, ServiceConfig, Transaction,
    TransactionHeader, TransactionId, TransactionModel, TransactionRegistry,
    TransactionRepository, TransactionStatus, BuilderRegistry,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The dedicated store holding `transactions.transactions` and `transactions.requests`
#[derive(Clone)]
pub struct SystemStore {
    /// Driver the bookkeeping meta-transactions run on
    pub driver: Arc<dyn Driver>,
    /// Builder producing the bookkeeping statements
    pub builder: Arc<dyn RequestBuilder>,
    /// Read path used by recovery
    pub repository: Arc<dyn TransactionRepository>,
}

/// Coordinator for one configured operation
pub struct Service {
    pub(crate) config: ServiceConfig,
    pub(crate) operation: OperationConfig,
    pub(crate) operation_hash: OperationHash,
    pub(crate) drivers: DriverSet,
    pub(crate) builders: BuilderRegistry,
    pub(crate) system: SystemStore,
    pub(crate) registry: Arc<dyn TransactionRegistry>,
    pub(crate) metrics: Arc<dyn MetricsCounter>,
}

impl Service {
    /// Validate the operation against the registered drivers and builders.
    ///
    /// Unknown drivers, unimplemented backends and missing builders are
    /// configuration errors here, never at message time.
    pub fn new(
        config: ServiceConfig,
        operation: OperationConfig,
        drivers: DriverSet,
        builders: BuilderRegistry,
        system: SystemStore,
    ) -> Result<Self, ConfigError> {
        operation.validate()?;
        for binding in &operation.storages {
            let driver = drivers.get(&binding.driver)?;
            driver.storage_type().ensure_implemented()?;
            builders.get(driver.storage_type())?;
        }
        if system.builder.storage_type() != system.driver.storage_type() {
            return Err(ConfigError::MissingBuilder(
                system.driver.storage_type().as_str().into(),
            ));
        }

        let operation_hash = operation.hash();
        Ok(Self {
            config,
            operation,
            operation_hash,
            drivers,
            builders,
            system,
            registry: Arc::new(InMemoryRegistry::new()),
            metrics: Arc::new(NoOpMetrics),
        })
    }

    /// Replace the default in-memory registry
    pub fn with_registry(mut self, registry: Arc<dyn TransactionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the default no-op metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCounter>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The operation this service executes
    pub fn operation(&self) -> &OperationConfig {
        &self.operation
    }

    /// Fingerprint of the current operation configuration
    pub fn operation_hash(&self) -> &OperationHash {
        &self.operation_hash
    }

    /// Transactions currently in flight on this service
    pub fn registry(&self) -> &Arc<dyn TransactionRegistry> {
        &self.registry
    }

    /// Run the system driver and every user driver
    pub async fn start(&self) -> Result<(), DriverError> {
        self.system.driver.run().await?;
        self.drivers.run_all().await?;
        info!(operation = %self.operation.name, instance_id = %self.config.instance_id, "Service started");
        Ok(())
    }

    /// Stop every driver, attempting all of them
    pub async fn stop(&self) -> Result<(), DriverError> {
        let users = self.drivers.stop_all().await;
        let system = self.system.driver.stop().await;
        info!(operation = %self.operation.name, "Service stopped");
        users.and(system)
    }

    /// Validate a message, build its per-driver requests and execute them
    pub async fn handle_message(
        &self,
        cancel: &CancellationToken,
        raw: RawMessage,
    ) -> Result<TransactionId, CoordinatorError> {
        self.operation.check_message(&raw)?;
        let requests = self.build_requests(&raw)?;
        self.exec_requests(cancel, requests, raw).await
    }

    /// One request per declared storage, built by that storage's builder
    pub fn build_requests(
        &self,
        raw: &RawMessage,
    ) -> Result<Vec<(Arc<dyn Driver>, Request)>, CoordinatorError> {
        self.operation
            .storages
            .iter()
            .map(|binding| {
                let driver = self.drivers.get(&binding.driver)?;
                let builder = self.builders.get(driver.storage_type())?;
                let spec = RequestSpec::new(&binding.table, self.operation.kind).with_message(raw);
                Ok((driver.clone(), builder.build(&spec)?))
            })
            .collect()
    }

    /// Execute a new transaction over `requests`.
    ///
    /// The transaction and its per-driver request rows are recorded in the
    /// system store before any user driver is begun.
    pub async fn exec_requests(
        &self,
        cancel: &CancellationToken,
        requests: Vec<(Arc<dyn Driver>, Request)>,
        raw: RawMessage,
    ) -> Result<TransactionId, CoordinatorError> {
        let mut tx = Transaction::new(requests, raw, self.header())?;
        let tx_id = tx.id();
        self.metrics.add_total_transactions();
        self.metrics.add_in_progress_transactions();
        self.track(&tx);
        debug!(tx_id = %tx_id, drivers = tx.len(), "Transaction created");

        if let Err(e) = self.persist_new(cancel, &tx).await {
            error!(tx_id = %tx_id, error = %e, "Failed to record transaction");
            let system = self.system.driver.id();
            self.fail(&mut tx, &system, &e.to_string());
            self.record_failure(&tx, false).await;
            self.untrack(&tx);
            return Err(e);
        }

        self.drive(cancel, &mut tx).await?;
        Ok(tx_id)
    }

    /// Commit every participant; requires `IN_PROGRESS`.
    ///
    /// On success the status is persisted, every driver is finished and the
    /// transaction leaves the registry. A failing commit runs the rollback
    /// guard over all other drivers, including ones already committed.
    pub async fn commit(
        &self,
        cancel: &CancellationToken,
        tx: &mut Transaction,
    ) -> Result<(), CoordinatorError> {
        tx.require(TransactionStatus::InProgress)?;
        let tx_id = tx.id();
        let timeout = self.timeout_for(tx);

        let mut failure = None;
        for p in tx.participants() {
            if let Err(e) = guarded(cancel, timeout, p.driver.commit(tx_id)).await {
                failure = Some((p.driver.id(), e));
                break;
            }
        }
        if let Some((driver, source)) = failure {
            return Err(self.rollback_guard(tx, driver, Phase::Commit, source).await);
        }

        tx.mark_success()?;
        self.on_transition(tx, TransactionStatus::InProgress);
        // Committed work must be recorded even if the caller gave up.
        let persisted = self.persist_status(&CancellationToken::new(), tx).await;
        if let Err(e) = &persisted {
            error!(tx_id = %tx_id, error = %e, "Committed transaction could not be recorded as SUCCESS");
        }
        self.finish_all(&CancellationToken::new(), tx).await;
        self.untrack(tx);
        debug!(tx_id = %tx_id, role = ?tx.role(), "Transaction committed");
        persisted
    }

    /// Roll back every driver except the failed one, then finish all of them.
    ///
    /// Requires `FAILED`. Each driver gets a rollback and a finish attempt
    /// regardless of earlier failures. `cancel` bounds the rollback calls
    /// only; the finish sweep always runs. Rollback and finish failures are
    /// summed into one `Cleanup` error.
    pub async fn rollback(
        &self,
        cancel: &CancellationToken,
        tx: &mut Transaction,
    ) -> Result<(), CoordinatorError> {
        tx.require(TransactionStatus::Failed)?;
        let tx_id = tx.id();
        let timeout = self.timeout_for(tx);

        let mut failures = 0;
        for p in tx.rollback_targets() {
            if let Err(e) = guarded(cancel, timeout, p.driver.rollback(tx_id)).await {
                warn!(tx_id = %tx_id, driver = %p.driver.name(), error = %e, "Rollback failed");
                failures += 1;
            }
        }
        failures += self.finish_all(&CancellationToken::new(), tx).await;
        self.record_failure(tx, false).await;
        self.untrack(tx);

        if failures > 0 {
            return Err(CoordinatorError::Cleanup {
                tx_id,
                action: "rollback/finish",
                failures,
            });
        }
        debug!(tx_id = %tx_id, "Transaction rolled back");
        Ok(())
    }

    /// Begin, exec and commit an already-recorded transaction
    pub(crate) fn drive<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        tx: &'a mut Transaction,
    ) -> BoxFuture<'a, Result<(), CoordinatorError>> {
        Box::pin(async move {
            self.begin(cancel, tx).await?;
            self.exec(cancel, tx).await?;
            self.commit(cancel, tx).await
        })
    }

    /// Begin on every driver; on any failure finish the drivers that began
    async fn begin(
        &self,
        cancel: &CancellationToken,
        tx: &mut Transaction,
    ) -> Result<(), CoordinatorError> {
        let tx_id = tx.id();
        let timeout = self.timeout_for(tx);

        let mut begun = Vec::new();
        let mut failure = None;
        for p in tx.participants() {
            match guarded(cancel, timeout, p.driver.begin(tx_id)).await {
                Ok(()) => begun.push(p.driver.clone()),
                Err(e) => {
                    warn!(tx_id = %tx_id, driver = %p.driver.name(), error = %e, "Begin failed");
                    if failure.is_none() {
                        failure = Some((p.driver.id(), e));
                    }
                }
            }
        }

        let Some((driver, source)) = failure else {
            return Ok(());
        };
        self.fail(tx, &driver, &source.to_string());
        let detached = CancellationToken::new();
        for d in &begun {
            if let Err(e) = guarded(&detached, timeout, d.finish_tx(tx_id)).await {
                warn!(tx_id = %tx_id, driver = %d.name(), error = %e, "Finish failed");
            }
        }
        // A transaction that never began anywhere is final, whatever the policy.
        self.record_failure(tx, true).await;
        self.untrack(tx);
        Err(CoordinatorError::Driver {
            tx_id,
            driver: driver.name,
            phase: Phase::Begin,
            source,
        })
    }

    async fn exec(
        &self,
        cancel: &CancellationToken,
        tx: &mut Transaction,
    ) -> Result<(), CoordinatorError> {
        let tx_id = tx.id();
        let timeout = self.timeout_for(tx);

        let mut failure = None;
        for p in tx.participants() {
            if let Err(e) = guarded(cancel, timeout, p.driver.exec(&p.request, tx_id)).await {
                failure = Some((p.driver.id(), e));
                break;
            }
        }
        match failure {
            Some((driver, source)) => Err(self.rollback_guard(tx, driver, Phase::Exec, source).await),
            None => Ok(()),
        }
    }

    /// Mark the transaction failed on `driver` and roll back everyone else
    async fn rollback_guard(
        &self,
        tx: &mut Transaction,
        driver: DriverId,
        phase: Phase,
        source: DriverError,
    ) -> CoordinatorError {
        let tx_id = tx.id();
        self.fail(tx, &driver, &source.to_string());
        // The caller's token may be what failed the call; cleanup runs detached.
        if let Err(e) = self.rollback(&CancellationToken::new(), tx).await {
            warn!(tx_id = %tx_id, error = %e, "Rollback incomplete");
        }
        CoordinatorError::Driver {
            tx_id,
            driver: driver.name,
            phase,
            source,
        }
    }

    fn fail(&self, tx: &mut Transaction, driver: &DriverId, error: &str) {
        if tx.mark_failed(driver, error) {
            error!(tx_id = %tx.id(), driver = %driver, error = %error, role = ?tx.role(), "Transaction failed");
            self.on_transition(tx, TransactionStatus::InProgress);
        }
    }

    async fn finish_all(&self, cancel: &CancellationToken, tx: &Transaction) -> usize {
        let tx_id = tx.id();
        let timeout = self.timeout_for(tx);
        let mut failures = 0;
        for p in tx.participants() {
            if let Err(e) = guarded(cancel, timeout, p.driver.finish_tx(tx_id)).await {
                warn!(tx_id = %tx_id, driver = %p.driver.name(), error = %e, "Finish failed");
                failures += 1;
            }
        }
        failures
    }

    /// Insert the transaction row, then one request row per driver
    async fn persist_new(
        &self,
        cancel: &CancellationToken,
        tx: &Transaction,
    ) -> Result<(), CoordinatorError> {
        let model = TransactionModel::from_transaction(tx)?;
        self.run_system(cancel, tx, model.insert_spec()).await?;
        for row in RequestModel::for_transaction(tx) {
            self.run_system(cancel, tx, row.insert_spec()).await?;
        }
        Ok(())
    }

    async fn persist_status(
        &self,
        cancel: &CancellationToken,
        tx: &Transaction,
    ) -> Result<(), CoordinatorError> {
        if tx.role().is_system() {
            return Ok(());
        }
        let model = TransactionModel::from_transaction(tx)?;
        self.run_system(cancel, tx, model.status_update_spec()).await
    }

    /// Persist `FAILED` per the failure policy.
    ///
    /// Replayed transactions and `always` callers persist regardless, so a
    /// row is retried at most once across restarts.
    async fn record_failure(&self, tx: &Transaction, always: bool) {
        if tx.role().is_system() {
            return;
        }
        let keep = self.config.failure_policy == FailurePolicy::KeepForReplay;
        if keep && !always && !tx.is_replay() {
            debug!(tx_id = %tx.id(), "Failed transaction left in progress for replay");
            return;
        }
        if let Err(e) = self.persist_status(&CancellationToken::new(), tx).await {
            warn!(tx_id = %tx.id(), error = %e, "Failed to record FAILED status");
        }
    }

    /// Run one bookkeeping statement about `parent` as a system transaction
    fn run_system<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        parent: &'a Transaction,
        spec: RequestSpec,
    ) -> BoxFuture<'a, Result<(), CoordinatorError>> {
        Box::pin(async move {
            let bookkeeping = |source: CoordinatorError| CoordinatorError::Bookkeeping {
                tx_id: parent.id(),
                source: Box::new(source),
            };
            let request = self
                .system
                .builder
                .build(&spec)
                .map_err(|e| bookkeeping(e.into()))?;
            let mut sys = Transaction::system(parent, self.system.driver.clone(), request)
                .map_err(bookkeeping)?;
            self.drive(cancel, &mut sys).await.map_err(bookkeeping)
        })
    }

    fn on_transition(&self, tx: &Transaction, from: TransactionStatus) {
        if tx.role().is_system() {
            return;
        }
        record_transition(self.metrics.as_ref(), from, tx.status());
        self.track(tx);
    }

    pub(crate) fn track(&self, tx: &Transaction) {
        if tx.role().is_system() {
            return;
        }
        if let Err(e) = self.registry.put(tx.snapshot()) {
            warn!(tx_id = %tx.id(), error = %e, "Registry update failed");
        }
    }

    fn untrack(&self, tx: &Transaction) {
        if tx.role().is_system() {
            return;
        }
        if let Err(e) = self.registry.remove(tx.id()) {
            warn!(tx_id = %tx.id(), error = %e, "Registry eviction failed");
        }
    }

    pub(crate) fn header(&self) -> TransactionHeader {
        TransactionHeader {
            instance_id: self.config.instance_id,
            operation_hash: self.operation_hash.clone(),
            operation: self.operation.name.clone(),
        }
    }

    fn timeout_for(&self, tx: &Transaction) -> Duration {
        if tx.role().is_system() {
            self.system.driver.config().insert_timeout()
        } else {
            self.operation.timeout()
        }
    }
}

/// Race a driver call against cancellation and a per-call timeout
async fn guarded<F>(cancel: &CancellationToken, timeout: Duration, call: F) -> Result<(), DriverError>
where
    F: Future<Output = Result<(), DriverError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriverError::Cancelled),
        res = tokio::time::timeout(timeout, call) => {
            res.unwrap_or(Err(DriverError::Timeout(timeout.as_millis() as u64)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init_tracing, memory_system_store, message, CallKind, ScriptedDriver};
    use crate::{
        Arg, Fields, MemoryBuilder, MemoryDriver, MemoryStore, OperationKind, TransactionStats,
        REQUESTS_TABLE, TRANSACTIONS_TABLE,
    };
    use serde_json::json;

    struct Fixture {
        store: MemoryStore,
        service: Service,
        stats: Arc<TransactionStats>,
        registry: Arc<InMemoryRegistry>,
    }

    fn fixture(drivers: Vec<Arc<dyn Driver>>, config: ServiceConfig) -> Fixture {
        fixture_on(MemoryStore::new(), drivers, config)
    }

    fn fixture_on(store: MemoryStore, drivers: Vec<Arc<dyn Driver>>, config: ServiceConfig) -> Fixture {
        init_tracing();
        let mut operation = OperationConfig::new("create_user", OperationKind::Create)
            .with_timeout(Duration::from_millis(50));
        let mut set = DriverSet::new();
        for driver in drivers {
            operation = operation.with_storage(driver.name(), "users");
            set = set.register(driver);
        }
        let builders = BuilderRegistry::new().register(Arc::new(MemoryBuilder));
        let stats = Arc::new(TransactionStats::new());
        let registry = Arc::new(InMemoryRegistry::new());
        let service = Service::new(config, operation, set, builders, memory_system_store(&store))
            .unwrap()
            .with_metrics(stats.clone())
            .with_registry(registry.clone());
        Fixture {
            store,
            service,
            stats,
            registry,
        }
    }

    fn config() -> ServiceConfig {
        ServiceConfig::new(crate::InstanceId(1))
    }

    fn recorded_status(store: &MemoryStore, tx_id: TransactionId) -> String {
        store
            .rows(TRANSACTIONS_TABLE)
            .iter()
            .find(|row| row.get("id") == Some(&Arg::Text(tx_id.to_string())))
            .and_then(|row| row.get("status").and_then(Arg::as_str).map(str::to_string))
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_driver_create_succeeds() {
        let store = MemoryStore::new();
        let main = Arc::new(MemoryDriver::new("main", store.clone()));
        let f = fixture_on(store, vec![main.clone()], config());

        let tx_id = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1, "name": "ann"})))
            .await
            .unwrap();

        assert_eq!(f.store.rows("users").len(), 1);
        assert_eq!(main.open_transactions(), 0);
        assert_eq!(recorded_status(&f.store, tx_id), "SUCCESS");
        assert_eq!(f.store.rows(REQUESTS_TABLE).len(), 1);

        let fields = Fields::from([("status".to_string(), Arg::Text("SUCCESS".into()))]);
        let count = f
            .service
            .system
            .repository
            .get_count_transactions_by_fields(&fields)
            .await
            .unwrap();
        assert_eq!(count, 1);

        assert!(f.registry.is_empty());
        let stats = f.stats.snapshot();
        assert_eq!((stats.total, stats.in_progress, stats.success), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_every_driver_finished_once_on_success() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let b = Arc::new(ScriptedDriver::new("b"));
        let f = fixture(vec![a.clone(), b.clone()], config());

        let tx_id = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap();

        for d in [&a, &b] {
            assert_eq!(d.count_for(CallKind::Begin, tx_id), 1);
            assert_eq!(d.count_for(CallKind::Exec, tx_id), 1);
            assert_eq!(d.count_for(CallKind::Commit, tx_id), 1);
            assert_eq!(d.count_for(CallKind::FinishTx, tx_id), 1);
            assert_eq!(d.count(CallKind::Rollback), 0);
        }
        assert_eq!(recorded_status(&f.store, tx_id), "SUCCESS");
        assert_eq!(f.store.rows(REQUESTS_TABLE).len(), 2);
    }

    #[tokio::test]
    async fn test_phases_are_ordered() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let b = Arc::new(ScriptedDriver::new("b"));
        let f = fixture(vec![a.clone(), b.clone()], config());
        f.service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap();

        let kinds: Vec<CallKind> = a.calls().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![CallKind::Begin, CallKind::Exec, CallKind::Commit, CallKind::FinishTx]
        );
    }

    #[tokio::test]
    async fn test_exec_failure_rolls_back_other_drivers() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let b = Arc::new(ScriptedDriver::new("b").fail_on(CallKind::Exec, "bad statement"));
        let f = fixture(vec![a.clone(), b.clone()], config());

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        match &err {
            CoordinatorError::Driver { driver, phase, .. } => {
                assert_eq!(driver.as_ref(), "b");
                assert_eq!(*phase, Phase::Exec);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(a.count(CallKind::Rollback), 1);
        assert_eq!(b.count(CallKind::Rollback), 0);
        assert_eq!(a.count(CallKind::FinishTx), 1);
        assert_eq!(b.count(CallKind::FinishTx), 1);
        assert_eq!(a.count(CallKind::Commit) + b.count(CallKind::Commit), 0);

        assert!(f.registry.is_empty());
        let stats = f.stats.snapshot();
        assert_eq!((stats.in_progress, stats.failed), (0, 1));
    }

    #[tokio::test]
    async fn test_keep_for_replay_leaves_failed_row_in_progress() {
        let a = Arc::new(ScriptedDriver::new("a").fail_on(CallKind::Exec, "bad statement"));
        let f = fixture(
            vec![a.clone()],
            config().with_failure_policy(FailurePolicy::KeepForReplay),
        );

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.failed_driver(), Some("a"));

        let rows = f.store.rows(TRANSACTIONS_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("status"), Some(&Arg::Text("IN_PROGRESS".into())));
    }

    #[tokio::test]
    async fn test_failure_persisted_by_default() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let b = Arc::new(ScriptedDriver::new("b").fail_on(CallKind::Exec, "bad statement"));
        let f = fixture(vec![a, b], config());

        f.service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        let rows = f.store.rows(TRANSACTIONS_TABLE);
        assert_eq!(rows[0].get("status"), Some(&Arg::Text("FAILED".into())));
        assert_eq!(rows[0].get("failed_driver"), Some(&Arg::Text("b".into())));
        assert!(matches!(rows[0].get("error"), Some(Arg::Text(e)) if e.contains("bad statement")));
    }

    #[tokio::test]
    async fn test_begin_failure_finishes_begun_drivers() {
        let a = Arc::new(ScriptedDriver::new("a").fail_on(CallKind::Begin, "connection refused"));
        let b = Arc::new(ScriptedDriver::new("b"));
        let f = fixture(vec![a.clone(), b.clone()], config());

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Driver { phase: Phase::Begin, .. }));
        assert_eq!(a.count(CallKind::Begin) + b.count(CallKind::Begin), 2);
        assert_eq!(b.count(CallKind::FinishTx), 1);
        assert_eq!(a.count(CallKind::FinishTx), 0);
        assert_eq!(a.count(CallKind::Exec) + b.count(CallKind::Exec), 0);
        assert_eq!(a.count(CallKind::Rollback) + b.count(CallKind::Rollback), 0);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_begin_failure_is_final_under_keep_for_replay() {
        let a = Arc::new(ScriptedDriver::new("a").fail_on(CallKind::Begin, "connection refused"));
        let f = fixture(
            vec![a.clone()],
            config().with_failure_policy(FailurePolicy::KeepForReplay),
        );

        f.service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        let rows = f.store.rows(TRANSACTIONS_TABLE);
        assert_eq!(rows[0].get("status"), Some(&Arg::Text("FAILED".into())));
        assert_eq!(rows[0].get("failed_driver"), Some(&Arg::Text("a".into())));
    }

    #[tokio::test]
    async fn test_rollback_finishes_every_driver_after_cancellation() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let b = Arc::new(ScriptedDriver::new("b"));
        let f = fixture(vec![a.clone(), b.clone()], config());
        let requests = f.service.build_requests(&message(json!({"id": 1}))).unwrap();
        let mut tx = Transaction::new(requests, RawMessage::new(), f.service.header()).unwrap();
        assert!(tx.mark_failed(&b.id(), "bad statement"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.service.rollback(&cancel, &mut tx).await.unwrap_err();

        assert!(matches!(err, CoordinatorError::Cleanup { failures: 1, .. }));
        assert_eq!(a.count(CallKind::Rollback), 0);
        assert_eq!(a.count(CallKind::FinishTx), 1);
        assert_eq!(b.count(CallKind::FinishTx), 1);
    }

    #[tokio::test]
    async fn test_rollback_counts_finish_failures() {
        let a = Arc::new(ScriptedDriver::new("a").fail_on(CallKind::FinishTx, "socket closed"));
        let b = Arc::new(ScriptedDriver::new("b"));
        let f = fixture(vec![a.clone(), b.clone()], config());
        let requests = f.service.build_requests(&message(json!({"id": 1}))).unwrap();
        let mut tx = Transaction::new(requests, RawMessage::new(), f.service.header()).unwrap();
        assert!(tx.mark_failed(&b.id(), "bad statement"));

        let err = f
            .service
            .rollback(&CancellationToken::new(), &mut tx)
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Cleanup { failures: 1, .. }));
        assert_eq!(a.count(CallKind::Rollback), 1);
        assert_eq!(b.count(CallKind::FinishTx), 1);
    }

    /// Memory driver that rejects every statement touching one table
    struct RejectingDriver {
        inner: MemoryDriver,
        table: &'static str,
    }

    #[async_trait::async_trait]
    impl Driver for RejectingDriver {
        async fn run(&self) -> Result<(), DriverError> {
            self.inner.run().await
        }
        async fn stop(&self) -> Result<(), DriverError> {
            self.inner.stop().await
        }
        async fn begin(&self, tx_id: TransactionId) -> Result<(), DriverError> {
            self.inner.begin(tx_id).await
        }
        async fn exec(&self, request: &Request, tx_id: TransactionId) -> Result<(), DriverError> {
            if request.value.contains(self.table) {
                return Err(DriverError::Statement(format!("{} is read-only", self.table).into()));
            }
            self.inner.exec(request, tx_id).await
        }
        async fn commit(&self, tx_id: TransactionId) -> Result<(), DriverError> {
            self.inner.commit(tx_id).await
        }
        async fn rollback(&self, tx_id: TransactionId) -> Result<(), DriverError> {
            self.inner.rollback(tx_id).await
        }
        async fn finish_tx(&self, tx_id: TransactionId) -> Result<(), DriverError> {
            self.inner.finish_tx(tx_id).await
        }
        fn storage_type(&self) -> crate::StorageType {
            self.inner.storage_type()
        }
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn config(&self) -> &crate::DriverConfig {
            self.inner.config()
        }
    }

    #[tokio::test]
    async fn test_request_row_failure_records_failed_transaction() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let mut f = fixture(vec![a.clone()], config());
        f.service.system.driver = Arc::new(RejectingDriver {
            inner: MemoryDriver::new("system", f.store.clone()),
            table: REQUESTS_TABLE,
        });

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Bookkeeping { .. }));
        assert!(a.calls().is_empty());
        assert!(f.store.rows(REQUESTS_TABLE).is_empty());
        let rows = f.store.rows(TRANSACTIONS_TABLE);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("status"), Some(&Arg::Text("FAILED".into())));
        assert_eq!(rows[0].get("failed_driver"), Some(&Arg::Text("system".into())));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_committed_drivers() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let b = Arc::new(ScriptedDriver::new("b").fail_on(CallKind::Commit, "serialization failure"));
        let f = fixture(vec![a.clone(), b.clone()], config());

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Driver { phase: Phase::Commit, .. }));
        assert_eq!(a.count(CallKind::Commit), 1);
        assert_eq!(a.count(CallKind::Rollback), 1);
        assert_eq!(b.count(CallKind::Rollback), 0);
        assert_eq!(a.count(CallKind::FinishTx), 1);
        assert_eq!(b.count(CallKind::FinishTx), 1);
    }

    #[tokio::test]
    async fn test_rollback_sweep_survives_driver_errors() {
        let a = Arc::new(ScriptedDriver::new("a").fail_on(CallKind::Rollback, "gone"));
        let b = Arc::new(ScriptedDriver::new("b"));
        let c = Arc::new(ScriptedDriver::new("c").fail_on(CallKind::Exec, "bad statement"));
        let f = fixture(vec![a.clone(), b.clone(), c.clone()], config());

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert_eq!(err.failed_driver(), Some("c"));
        assert_eq!(a.count(CallKind::Rollback), 1);
        assert_eq!(b.count(CallKind::Rollback), 1);
        for d in [&a, &b, &c] {
            assert_eq!(d.count(CallKind::FinishTx), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_timeout_is_per_call() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let b = Arc::new(ScriptedDriver::new("b").delay_on(CallKind::Exec, Duration::from_secs(5)));
        let f = fixture(vec![a.clone(), b.clone()], config());

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::Driver {
                phase: Phase::Exec,
                source: DriverError::Timeout(50),
                ..
            }
        ));
        assert_eq!(a.count(CallKind::Rollback), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_user_drivers() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let f = fixture(vec![a.clone()], config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .service
            .handle_message(&cancel, message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Bookkeeping { .. }));
        assert!(a.calls().is_empty());
        assert!(f.store.rows(TRANSACTIONS_TABLE).is_empty());
        assert_eq!(f.stats.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_bookkeeping_failure_blocks_user_writes() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let mut f = fixture(vec![a.clone()], config());
        let system = Arc::new(ScriptedDriver::new("system").fail_on(CallKind::Exec, "disk full"));
        f.service.system.driver = system.clone();

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Bookkeeping { .. }));
        assert_eq!(err.failed_driver(), Some("system"));
        assert!(a.calls().is_empty());
        assert_eq!(
            system.count(CallKind::FinishTx),
            system.count(CallKind::Begin)
        );
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_commit_and_rollback_require_status() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let f = fixture(vec![a.clone()], config());
        let requests = f.service.build_requests(&message(json!({"id": 1}))).unwrap();
        let mut tx = Transaction::new(requests, RawMessage::new(), f.service.header()).unwrap();
        let cancel = CancellationToken::new();

        let err = f.service.rollback(&cancel, &mut tx).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::InvalidStatus {
                expected: TransactionStatus::Failed,
                ..
            }
        ));

        tx.mark_success().unwrap();
        let err = f.service.commit(&cancel, &mut tx).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::InvalidStatus {
                expected: TransactionStatus::InProgress,
                actual: TransactionStatus::Success,
                ..
            }
        ));
        assert!(a.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_message_never_reaches_drivers() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let mut f = fixture(vec![a.clone()], config());
        f.service.operation = f.service.operation.clone().with_field("age", crate::FieldType::Integer);

        let err = f
            .service
            .handle_message(&CancellationToken::new(), message(json!({"id": 1, "age": "old"})))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Validation(_)));
        assert!(a.calls().is_empty());
        assert!(f.store.rows(TRANSACTIONS_TABLE).is_empty());
        assert_eq!(f.stats.snapshot().total, 0);
    }

    #[tokio::test]
    async fn test_unknown_driver_is_config_error() {
        let store = MemoryStore::new();
        let operation = OperationConfig::new("create_user", OperationKind::Create)
            .with_storage("missing", "users");
        let result = Service::new(
            config(),
            operation,
            DriverSet::new(),
            BuilderRegistry::new().register(Arc::new(MemoryBuilder)),
            memory_system_store(&store),
        );
        assert!(matches!(result, Err(ConfigError::UnknownDriver(_))));
    }

    #[tokio::test]
    async fn test_two_storages_on_one_driver_rejected_at_setup() {
        let store = MemoryStore::new();
        let main: Arc<dyn Driver> = Arc::new(MemoryDriver::new("main", store.clone()));
        let operation = OperationConfig::new("create_user", OperationKind::Create)
            .with_storage("main", "users")
            .with_storage("main", "audit");
        let result = Service::new(
            config(),
            operation,
            DriverSet::new().register(main),
            BuilderRegistry::new().register(Arc::new(MemoryBuilder)),
            memory_system_store(&store),
        );
        assert!(matches!(result, Err(ConfigError::DuplicateDriver(_))));
    }

    #[tokio::test]
    async fn test_exec_requests_rejects_duplicate_driver() {
        let a = Arc::new(ScriptedDriver::new("a"));
        let f = fixture(vec![a.clone()], config());
        let mut requests = f.service.build_requests(&message(json!({"id": 1}))).unwrap();
        requests.push(requests[0].clone());

        let err = f
            .service
            .exec_requests(&CancellationToken::new(), requests, message(json!({"id": 1})))
            .await
            .unwrap_err();

        assert!(err.is_config());
        assert!(a.calls().is_empty());
        assert!(f.store.rows(TRANSACTIONS_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_unimplemented_backend_rejected_at_setup() {
        let store = MemoryStore::new();
        let queue: Arc<dyn Driver> = Arc::new(ScriptedDriver::with_type("events", crate::StorageType::RabbitMq));
        let operation = OperationConfig::new("create_user", OperationKind::Create)
            .with_storage("events", "users");
        let result = Service::new(
            config(),
            operation,
            DriverSet::new().register(queue),
            BuilderRegistry::new().register(Arc::new(MemoryBuilder)),
            memory_system_store(&store),
        );
        assert!(matches!(result, Err(ConfigError::Unsupported(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_messages_share_drivers() {
        let store = MemoryStore::new();
        let main: Arc<dyn Driver> = Arc::new(MemoryDriver::new("main", store.clone()));
        let operation = OperationConfig::new("create_user", OperationKind::Create).with_storage("main", "users");
        let service = Arc::new(
            Service::new(
                config(),
                operation,
                DriverSet::new().register(main),
                BuilderRegistry::new().register(Arc::new(MemoryBuilder)),
                memory_system_store(&store),
            )
            .unwrap(),
        );

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .handle_message(&CancellationToken::new(), message(json!({"id": i})))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.rows("users").len(), 16);
        assert_eq!(store.rows(TRANSACTIONS_TABLE).len(), 16);
        assert!(store
            .rows(TRANSACTIONS_TABLE)
            .iter()
            .all(|row| row.get("status") == Some(&Arg::Text("SUCCESS".into()))));
        assert!(service.registry().is_empty());
    }
}
