//! PostgreSQL backend: per-transaction connections, SQL builder and the
//! system-store repository
//!
//! ## Schema
//!
//! `PostgresRepository::ensure_schema` creates the system tables:
//! ```sql
//! CREATE TABLE IF NOT EXISTS transactions.transactions (
//!     id             TEXT PRIMARY KEY,
//!     status         TEXT NOT NULL,
//!     data           TEXT NOT NULL,
//!     error          TEXT,
//!     instance_id    INT NOT NULL,
//!     failed_driver  TEXT,
//!     operation_hash BYTEA NOT NULL,
//!     operation_type TEXT NOT NULL,
//!     created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE TABLE IF NOT EXISTS transactions.requests (
//!     id          UUID PRIMARY KEY,
//!     tx_id       TEXT NOT NULL REFERENCES transactions.transactions (id),
//!     driver_type TEXT NOT NULL,
//!     driver_name TEXT NOT NULL,
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```

use crate::repository::check_filter;
use crate::request::check_identifier;
use crate::{
    Arg, BuilderError, ConfigError, Driver, DriverConfig, DriverError, Fields, OperationKind,
    Request, RequestBuilder, RequestSpec, RepositoryError, StorageType, TransactionId,
    TransactionModel, TransactionRepository, TransactionStatus, KEY_FIELD, TRANSACTIONS_TABLE,
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

const CREATE_SCHEMA_SQL: &str = r#"
    CREATE SCHEMA IF NOT EXISTS transactions;
    CREATE TABLE IF NOT EXISTS transactions.transactions (
        id             TEXT PRIMARY KEY,
        status         TEXT NOT NULL,
        data           TEXT NOT NULL,
        error          TEXT,
        instance_id    INT NOT NULL,
        failed_driver  TEXT,
        operation_hash BYTEA NOT NULL,
        operation_type TEXT NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
    CREATE INDEX IF NOT EXISTS transactions_recovery_idx
        ON transactions.transactions (status, instance_id, operation_type);
    CREATE TABLE IF NOT EXISTS transactions.requests (
        id          UUID PRIMARY KEY,
        tx_id       TEXT NOT NULL REFERENCES transactions.transactions (id),
        driver_type TEXT NOT NULL,
        driver_name TEXT NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );
"#;

const TRANSACTION_COLUMNS: &str =
    "id, status, data, error, instance_id, failed_driver, operation_hash, operation_type, created_at";

/// Encodes by the column type the server reports.
///
/// Integers widen or narrow to the integer column and may bind to float or
/// text columns; text binds to uuid and json columns. Every other pairing
/// goes through the inner value's checked encoding and fails with a
/// wrong-type error instead of sending bytes the server cannot read.
impl ToSql for Arg {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Arg::Null => Ok(IsNull::Yes),
            Arg::Bool(v) => v.to_sql_checked(ty, out),
            Arg::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            Arg::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            Arg::Text(s) => match *ty {
                Type::UUID => uuid::Uuid::parse_str(s)?.to_sql(ty, out),
                Type::JSON | Type::JSONB => serde_json::Value::String(s.clone()).to_sql(ty, out),
                _ => s.to_sql_checked(ty, out),
            },
            Arg::Bytes(b) => b.to_sql_checked(ty, out),
            Arg::Timestamp(t) => t.to_sql_checked(ty, out),
            Arg::Json(v) => match *ty {
                Type::TEXT | Type::VARCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn params(args: &[Arg]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

/// Libpq-style connection string for a driver config
pub fn connection_string(config: &DriverConfig) -> String {
    format!(
        "host={} port={} user={} password={} dbname={} connect_timeout={}",
        config.host,
        config.port,
        config.user,
        config.password,
        config.db_name,
        config.read_timeout().as_secs().max(1),
    )
}

async fn connect(connection_string: &str) -> Result<Client, DriverError> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .map_err(|e| DriverError::Connection(e.to_string().into()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("PostgreSQL connection error: {}", e);
        }
    });
    Ok(client)
}

/// Driver opening one dedicated connection per transaction
pub struct PostgresDriver {
    config: DriverConfig,
    connection_string: String,
    open: Mutex<HashMap<TransactionId, Arc<Client>>>,
}

impl PostgresDriver {
    pub fn new(config: DriverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.storage_type != StorageType::Postgres {
            return Err(ConfigError::Unsupported(
                format!("{} config for postgres driver", config.storage_type).into(),
            ));
        }
        if config.host.is_empty() {
            return Err(ConfigError::MissingOption(format!("host for driver {}", config.name).into()));
        }
        Ok(Self {
            connection_string: connection_string(&config),
            config,
            open: Mutex::new(HashMap::new()),
        })
    }

    async fn client(&self, tx_id: TransactionId) -> Result<Arc<Client>, DriverError> {
        self.open
            .lock()
            .await
            .get(&tx_id)
            .cloned()
            .ok_or(DriverError::NotBegun(tx_id))
    }
}

fn statement_error(e: tokio_postgres::Error) -> DriverError {
    DriverError::Statement(e.to_string().into())
}

#[async_trait]
impl Driver for PostgresDriver {
    async fn run(&self) -> Result<(), DriverError> {
        let client = connect(&self.connection_string).await?;
        client.batch_execute("SELECT 1").await.map_err(statement_error)?;
        info!(driver = %self.config.name, host = %self.config.host, "PostgreSQL driver connected");
        Ok(())
    }

    async fn stop(&self) -> Result<(), DriverError> {
        let mut open = self.open.lock().await;
        if !open.is_empty() {
            warn!(driver = %self.config.name, open = open.len(), "Stopping with open transactions");
        }
        open.clear();
        Ok(())
    }

    async fn begin(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        if self.open.lock().await.contains_key(&tx_id) {
            return Err(DriverError::AlreadyBegun(tx_id));
        }
        let client = connect(&self.connection_string).await?;
        client.batch_execute("BEGIN").await.map_err(statement_error)?;

        let mut open = self.open.lock().await;
        if open.contains_key(&tx_id) {
            return Err(DriverError::AlreadyBegun(tx_id));
        }
        open.insert(tx_id, Arc::new(client));
        debug!(driver = %self.config.name, tx_id = %tx_id, "Transaction begun");
        Ok(())
    }

    async fn exec(&self, request: &Request, tx_id: TransactionId) -> Result<(), DriverError> {
        let client = self.client(tx_id).await?;
        let rows = client
            .execute(request.value.as_str(), &params(&request.args))
            .await
            .map_err(statement_error)?;
        debug!(driver = %self.config.name, tx_id = %tx_id, rows, "Statement executed");
        Ok(())
    }

    async fn commit(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        let client = self.client(tx_id).await?;
        client.batch_execute("COMMIT").await.map_err(statement_error)
    }

    async fn rollback(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        let client = self.open.lock().await.get(&tx_id).cloned();
        match client {
            Some(client) => client.batch_execute("ROLLBACK").await.map_err(statement_error),
            None => Ok(()),
        }
    }

    async fn finish_tx(&self, tx_id: TransactionId) -> Result<(), DriverError> {
        // Dropping the last handle closes the connection; an uncommitted
        // transaction is discarded by the server.
        self.open.lock().await.remove(&tx_id);
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Postgres
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }
}

/// Builds parameterized SQL; columns are emitted in sorted order
pub struct PostgresBuilder;

impl RequestBuilder for PostgresBuilder {
    fn storage_type(&self) -> StorageType {
        StorageType::Postgres
    }

    fn build(&self, spec: &RequestSpec) -> Result<Request, BuilderError> {
        check_identifier(&spec.table)?;
        for column in spec.values.keys() {
            check_identifier(column)?;
        }

        let (value, args) = match spec.kind {
            OperationKind::Create => {
                if spec.values.is_empty() {
                    return Err(BuilderError::EmptyValues);
                }
                let columns: Vec<&str> = spec.values.keys().map(String::as_str).collect();
                let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
                (
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        spec.table,
                        columns.join(", "),
                        placeholders.join(", ")
                    ),
                    spec.values.values().cloned().collect(),
                )
            }
            OperationKind::Update => {
                let key = spec.key()?.clone();
                let mut args = Vec::new();
                let mut sets = Vec::new();
                for (column, value) in spec.values.iter().filter(|(k, _)| k.as_str() != KEY_FIELD) {
                    args.push(value.clone());
                    sets.push(format!("{} = ${}", column, args.len()));
                }
                if sets.is_empty() {
                    return Err(BuilderError::EmptyValues);
                }
                args.push(key);
                (
                    format!(
                        "UPDATE {} SET {} WHERE {} = ${}",
                        spec.table,
                        sets.join(", "),
                        KEY_FIELD,
                        args.len()
                    ),
                    args,
                )
            }
            OperationKind::Delete => (
                format!("DELETE FROM {} WHERE {} = $1", spec.table, KEY_FIELD),
                vec![spec.key()?.clone()],
            ),
            OperationKind::DeleteAll => (format!("DELETE FROM {}", spec.table), Vec::new()),
        };

        Ok(Request {
            value,
            args,
            raw: spec.raw.clone(),
        })
    }
}

/// System-store repository over a single PostgreSQL connection
pub struct PostgresRepository {
    client: Client,
}

impl PostgresRepository {
    /// Connect to PostgreSQL and create the repository
    pub async fn new(connection_string: &str) -> Result<Self, RepositoryError> {
        let client = connect(connection_string)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string().into()))?;
        info!("Transaction repository connected to PostgreSQL");
        Ok(Self { client })
    }

    /// Create the system tables if they don't exist
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        self.client
            .batch_execute(CREATE_SCHEMA_SQL)
            .await
            .map_err(|e| RepositoryError::Storage(format!("Failed to create system tables: {}", e).into()))?;
        debug!("System tables ensured");
        Ok(())
    }
}

/// `WHERE` clause and its arguments for a filter
fn where_clause(fields: &Fields) -> Result<(String, Vec<&Arg>), RepositoryError> {
    check_filter(fields)?;
    if fields.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let conditions: Vec<String> = fields
        .keys()
        .enumerate()
        .map(|(i, column)| format!("{} = ${}", column, i + 1))
        .collect();
    Ok((
        format!(" WHERE {}", conditions.join(" AND ")),
        fields.values().collect(),
    ))
}

fn decode(row: &tokio_postgres::Row) -> Result<TransactionModel, tokio_postgres::Error> {
    Ok(TransactionModel {
        id: row.try_get(0)?,
        status: row.try_get(1)?,
        data: row.try_get(2)?,
        error: row.try_get(3)?,
        instance_id: row.try_get(4)?,
        failed_driver: row.try_get(5)?,
        operation_hash: row.try_get(6)?,
        operation_type: row.try_get(7)?,
        created_at: row.try_get(8)?,
    })
}

#[async_trait]
impl TransactionRepository for PostgresRepository {
    async fn get_all_transactions_by_fields(
        &self,
        fields: &Fields,
    ) -> Result<Vec<TransactionModel>, RepositoryError> {
        let (clause, args) = where_clause(fields)?;
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY created_at",
            TRANSACTION_COLUMNS, TRANSACTIONS_TABLE, clause
        );
        let params: Vec<&(dyn ToSql + Sync)> = args.into_iter().map(|a| a as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(sql.as_str(), &params)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string().into()))?;

        rows.iter()
            .map(|row| decode(row).map_err(|e| RepositoryError::Decode(e.to_string().into())))
            .collect()
    }

    async fn get_count_transactions_by_fields(&self, fields: &Fields) -> Result<usize, RepositoryError> {
        let (clause, args) = where_clause(fields)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", TRANSACTIONS_TABLE, clause);
        let params: Vec<&(dyn ToSql + Sync)> = args.into_iter().map(|a| a as &(dyn ToSql + Sync)).collect();
        let row = self
            .client
            .query_one(sql.as_str(), &params)
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string().into()))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| RepositoryError::Decode(e.to_string().into()))?;
        Ok(count as usize)
    }

    async fn update_status_many(
        &self,
        ids: &[String],
        status: TransactionStatus,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let updated = self
            .client
            .execute(
                "UPDATE transactions.transactions SET status = $1, error = $2 WHERE id = ANY($3)",
                &[&status.as_str(), &reason, &ids],
            )
            .await
            .map_err(|e| RepositoryError::Storage(e.to_string().into()))?;
        debug!(updated, status = %status, "Transaction statuses updated");
        Ok(())
    }
}
