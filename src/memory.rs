//! In-process backend: shared tables, a transactional driver over them, its
//! request builder and a system-store repository

use crate::repository::check_filter;
use crate::{
    Arg, BuilderError, Driver, DriverConfig, DriverError, Fields, OperationKind, Request,
    RequestBuilder, RequestSpec, RepositoryError, StorageType, TransactionId, TransactionModel,
    TransactionRepository, TransactionStatus, TRANSACTIONS_TABLE,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

/// One stored row
pub type Row = BTreeMap<String, Arg>;

type Tables = HashMap<String, Vec<Row>>;

/// Statement language of the in-memory backend, JSON-encoded in `Request::value`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MemoryStatement {
    Insert { table: String, row: Row },
    Update { table: String, key: Arg, values: Row },
    Delete { table: String, key: Arg },
    DeleteAll { table: String },
}

impl MemoryStatement {
    fn apply(&self, tables: &mut Tables) -> Result<(), DriverError> {
        match self {
            Self::Insert { table, row } => {
                let rows = tables.entry(table.clone()).or_default();
                if let Some(key) = row.get(crate::KEY_FIELD) {
                    if rows.iter().any(|r| r.get(crate::KEY_FIELD) == Some(key)) {
                        return Err(DriverError::Statement(
                            format!("duplicate key {:?} in {}", key, table).into(),
                        ));
                    }
                }
                rows.push(row.clone());
            }
            Self::Update { table, key, values } => {
                for row in tables.entry(table.clone()).or_default() {
                    if row.get(crate::KEY_FIELD) == Some(key) {
                        row.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
            }
            Self::Delete { table, key } => {
                if let Some(rows) = tables.get_mut(table) {
                    rows.retain(|row| row.get(crate::KEY_FIELD) != Some(key));
                }
            }
            Self::DeleteAll { table } => {
                if let Some(rows) = tables.get_mut(table) {
                    rows.clear();
                }
            }
        }
        Ok(())
    }
}

/// Shared in-process tables
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row in `table`
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .map(|t| t.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Insert a row directly, outside any transaction
    pub fn insert(&self, table: &str, row: Row) -> Result<(), DriverError> {
        let mut tables = self.write()?;
        MemoryStatement::Insert {
            table: table.to_string(),
            row,
        }
        .apply(&mut tables)
    }

    /// Apply all statements or none
    fn apply_all(&self, statements: &[MemoryStatement]) -> Result<(), DriverError> {
        let mut tables = self.write()?;
        let mut staged = tables.clone();
        for statement in statements {
            statement.apply(&mut staged)?;
        }
        *tables = staged;
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, DriverError> {
        self.tables
            .write()
            .map_err(|e| DriverError::Connection(e.to_string().into()))
    }
}

/// Driver staging statements per transaction and applying them on commit
pub struct MemoryDriver {
    config: DriverConfig,
    store: MemoryStore,
    open: Mutex<HashMap<TransactionId, Vec<MemoryStatement>>>,
}

impl MemoryDriver {
    pub fn new(name: &str, store: MemoryStore) -> Self {
        Self {
            config: DriverConfig::new(name, StorageType::Memory),
            store,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Number of transactions currently open on this driver
    pub fn open_transactions(&self) -> usize {
        self.open.lock().map(|o| o.len()).unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<TransactionId, Vec<MemoryStatement>>>, DriverError> {
        self.open
            .lock()
            .map_err(|e| DriverError::Connection(e.to_string().into()))
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn run(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.lock()?.clear();
        Ok(())
    }

    async fn begin(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        let mut open = self.lock()?;
        if open.contains_key(&tx_id) {
            return Err(DriverError::AlreadyBegun(tx_id));
        }
        open.insert(tx_id, Vec::new());
        Ok(())
    }

    async fn exec(&self, request: &Request, tx_id: TransactionId) -> Result<(), DriverError> {
        let statement: MemoryStatement = serde_json::from_str(&request.value)
            .map_err(|e| DriverError::Statement(e.to_string().into()))?;
        let mut open = self.lock()?;
        let staged = open.get_mut(&tx_id).ok_or(DriverError::NotBegun(tx_id))?;
        staged.push(statement);
        Ok(())
    }

    async fn commit(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        let staged = self.lock()?.remove(&tx_id).ok_or(DriverError::NotBegun(tx_id))?;
        self.store.apply_all(&staged)
    }

    async fn rollback(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        self.lock()?.remove(&tx_id);
        Ok(())
    }

    async fn finish_tx(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        self.lock()?.remove(&tx_id);
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }
}

/// Builds `MemoryStatement` requests
pub struct MemoryBuilder;

impl RequestBuilder for MemoryBuilder {
    fn storage_type(&self) -> StorageType {
        StorageType::Memory
    }

    fn build(&self, spec: &RequestSpec) -> Result<Request, BuilderError> {
        crate::request::check_identifier(&spec.table)?;
        let table = spec.table.to_string();
        let statement = match spec.kind {
            OperationKind::Create => {
                if spec.values.is_empty() {
                    return Err(BuilderError::EmptyValues);
                }
                MemoryStatement::Insert {
                    table,
                    row: spec.values.clone(),
                }
            }
            OperationKind::Update => {
                let key = spec.key()?.clone();
                let values: Row = spec
                    .values
                    .iter()
                    .filter(|(k, _)| k.as_str() != crate::KEY_FIELD)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if values.is_empty() {
                    return Err(BuilderError::EmptyValues);
                }
                MemoryStatement::Update { table, key, values }
            }
            OperationKind::Delete => MemoryStatement::Delete {
                table,
                key: spec.key()?.clone(),
            },
            OperationKind::DeleteAll => MemoryStatement::DeleteAll { table },
        };

        let value = serde_json::to_string(&statement)
            .map_err(|e| BuilderError::Encode(e.to_string().into()))?;
        Ok(Request {
            value,
            args: Vec::new(),
            raw: spec.raw.clone(),
        })
    }
}

/// System-store repository over a `MemoryStore`
pub struct MemoryRepository {
    store: MemoryStore,
}

impl MemoryRepository {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    fn matching(&self, fields: &Fields) -> Result<Vec<TransactionModel>, RepositoryError> {
        check_filter(fields)?;
        self.store
            .rows(TRANSACTIONS_TABLE)
            .iter()
            .filter(|row| fields.iter().all(|(k, v)| row.get(k).unwrap_or(&Arg::Null) == v))
            .map(|row| {
                TransactionModel::from_columns(row)
                    .map_err(|e| RepositoryError::Decode(e.to_string().into()))
            })
            .collect()
    }
}

#[async_trait]
impl TransactionRepository for MemoryRepository {
    async fn get_all_transactions_by_fields(
        &self,
        fields: &Fields,
    ) -> Result<Vec<TransactionModel>, RepositoryError> {
        self.matching(fields)
    }

    async fn get_count_transactions_by_fields(&self, fields: &Fields) -> Result<usize, RepositoryError> {
        Ok(self.matching(fields)?.len())
    }

    async fn update_status_many(
        &self,
        ids: &[String],
        status: TransactionStatus,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        let mut tables = self
            .store
            .tables
            .write()
            .map_err(|e| RepositoryError::Storage(e.to_string().into()))?;
        for row in tables.entry(TRANSACTIONS_TABLE.to_string()).or_default() {
            let matched = row
                .get(crate::KEY_FIELD)
                .and_then(Arg::as_str)
                .is_some_and(|id| ids.iter().any(|i| i == id));
            if matched {
                row.insert("status".into(), Arg::Text(status.as_str().to_string()));
                row.insert("error".into(), Arg::Text(reason.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(kind: OperationKind, raw: serde_json::Value) -> RequestSpec {
        RequestSpec::new("users", kind).with_message(raw.as_object().unwrap())
    }

    #[tokio::test]
    async fn test_commit_applies_staged_statements() {
        let store = MemoryStore::new();
        let driver = MemoryDriver::new("main", store.clone());
        let tx = TransactionId::new();

        let insert = MemoryBuilder.build(&spec(OperationKind::Create, json!({"id": 1, "name": "ann"}))).unwrap();
        driver.begin(tx).await.unwrap();
        driver.exec(&insert, tx).await.unwrap();
        assert!(store.rows("users").is_empty());

        driver.commit(tx).await.unwrap();
        driver.finish_tx(tx).await.unwrap();
        let rows = store.rows("users");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Arg::Text("ann".into())));
        assert_eq!(driver.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_rollback_discards_and_tolerates_unknown() {
        let store = MemoryStore::new();
        let driver = MemoryDriver::new("main", store.clone());
        let tx = TransactionId::new();

        let insert = MemoryBuilder.build(&spec(OperationKind::Create, json!({"id": 1}))).unwrap();
        driver.begin(tx).await.unwrap();
        driver.exec(&insert, tx).await.unwrap();
        driver.rollback(tx).await.unwrap();
        assert!(store.rows("users").is_empty());

        driver.rollback(TransactionId::new()).await.unwrap();
        assert!(matches!(driver.commit(tx).await, Err(DriverError::NotBegun(_))));
    }

    #[tokio::test]
    async fn test_begin_twice_rejected() {
        let driver = MemoryDriver::new("main", MemoryStore::new());
        let tx = TransactionId::new();
        driver.begin(tx).await.unwrap();
        assert!(matches!(driver.begin(tx).await, Err(DriverError::AlreadyBegun(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let store = MemoryStore::new();
        let driver = MemoryDriver::new("main", store.clone());
        store.insert("users", Row::from([("id".to_string(), Arg::Int(1))])).unwrap();

        let tx = TransactionId::new();
        driver.begin(tx).await.unwrap();
        let ok = MemoryBuilder.build(&spec(OperationKind::Create, json!({"id": 2}))).unwrap();
        let dup = MemoryBuilder.build(&spec(OperationKind::Create, json!({"id": 1}))).unwrap();
        driver.exec(&ok, tx).await.unwrap();
        driver.exec(&dup, tx).await.unwrap();

        assert!(matches!(driver.commit(tx).await, Err(DriverError::Statement(_))));
        assert_eq!(store.rows("users").len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = MemoryStore::new();
        let driver = MemoryDriver::new("main", store.clone());
        store
            .insert(
                "users",
                Row::from([
                    ("id".to_string(), Arg::Int(1)),
                    ("name".to_string(), Arg::Text("ann".into())),
                ]),
            )
            .unwrap();

        let tx = TransactionId::new();
        driver.begin(tx).await.unwrap();
        let update = MemoryBuilder.build(&spec(OperationKind::Update, json!({"id": 1, "name": "bob"}))).unwrap();
        driver.exec(&update, tx).await.unwrap();
        driver.commit(tx).await.unwrap();
        assert_eq!(store.rows("users")[0].get("name"), Some(&Arg::Text("bob".into())));

        let tx = TransactionId::new();
        driver.begin(tx).await.unwrap();
        let delete = MemoryBuilder.build(&spec(OperationKind::Delete, json!({"id": 1}))).unwrap();
        driver.exec(&delete, tx).await.unwrap();
        driver.commit(tx).await.unwrap();
        assert!(store.rows("users").is_empty());
    }

    #[test]
    fn test_builder_rejects_bad_input() {
        assert!(matches!(
            MemoryBuilder.build(&spec(OperationKind::Delete, json!({"name": "x"}))),
            Err(BuilderError::MissingKey(_))
        ));
        assert!(matches!(
            MemoryBuilder.build(&RequestSpec::new("users", OperationKind::Create)),
            Err(BuilderError::EmptyValues)
        ));
        assert!(matches!(
            MemoryBuilder.build(&RequestSpec::new("users;", OperationKind::DeleteAll)),
            Err(BuilderError::InvalidIdentifier(_))
        ));
    }
}
