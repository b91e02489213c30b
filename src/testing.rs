//! Test harness: a call-recording driver with failure injection

use crate::{
    Driver, DriverConfig, DriverError, MemoryBuilder, MemoryDriver, MemoryRepository, MemoryStore,
    RawMessage, Request, StorageType, SystemStore, TransactionId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Driver call kinds, for counting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    Begin,
    Exec,
    Commit,
    Rollback,
    FinishTx,
}

/// One recorded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub tx_id: TransactionId,
}

/// Driver that records every call and fails or stalls on demand
pub struct ScriptedDriver {
    config: DriverConfig,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<CallKind, Box<str>>>,
    delays: Mutex<HashMap<CallKind, Duration>>,
}

impl ScriptedDriver {
    pub fn new(name: &str) -> Self {
        Self::with_type(name, StorageType::Memory)
    }

    pub fn with_type(name: &str, storage_type: StorageType) -> Self {
        Self {
            config: DriverConfig::new(name, storage_type),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
        }
    }

    /// Make every future call of `kind` fail with a statement error
    pub fn fail_on(self, kind: CallKind, reason: &str) -> Self {
        self.failures.lock().unwrap().insert(kind, reason.into());
        self
    }

    /// Make every future call of `kind` sleep first
    pub fn delay_on(self, kind: CallKind, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(kind, delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.kind == kind).count()
    }

    pub fn count_for(&self, kind: CallKind, tx_id: TransactionId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.kind == kind && c.tx_id == tx_id)
            .count()
    }

    async fn record(&self, kind: CallKind, tx_id: TransactionId) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(Call { kind, tx_id });
        let delay = self.delays.lock().unwrap().get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.lock().unwrap().get(&kind) {
            Some(reason) => Err(DriverError::Statement(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn run(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn begin(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        self.record(CallKind::Begin, tx_id).await
    }

    async fn exec(&self, _request: &Request, tx_id: TransactionId) -> Result<(), DriverError> {
        self.record(CallKind::Exec, tx_id).await
    }

    async fn commit(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        self.record(CallKind::Commit, tx_id).await
    }

    async fn rollback(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        self.record(CallKind::Rollback, tx_id).await
    }

    async fn finish_tx(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        self.record(CallKind::FinishTx, tx_id).await
    }

    fn storage_type(&self) -> StorageType {
        self.config.storage_type
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }
}

/// System store backed by the `transactions.*` tables of `store`
pub fn memory_system_store(store: &MemoryStore) -> SystemStore {
    SystemStore {
        driver: Arc::new(MemoryDriver::new("system", store.clone())),
        builder: Arc::new(MemoryBuilder),
        repository: Arc::new(MemoryRepository::new(store.clone())),
    }
}

/// Raw message from a JSON object literal
pub fn message(value: serde_json::Value) -> RawMessage {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("message must be a JSON object, got {}", other),
    }
}

/// Install a `tracing` subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
