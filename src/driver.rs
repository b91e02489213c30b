//! Storage driver capability set

use crate::{ConfigError, DriverError, Request, TransactionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Storage technology behind a driver
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Relational tables
    Postgres,
    /// In-process tables
    Memory,
    /// Message queue (declared, not implemented)
    RabbitMq,
    /// Search index (declared, not implemented)
    Elasticsearch,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Memory => "memory",
            Self::RabbitMq => "rabbitmq",
            Self::Elasticsearch => "elasticsearch",
        }
    }

    /// Whether a driver exists for this storage type
    pub fn is_implemented(&self) -> bool {
        matches!(self, Self::Postgres | Self::Memory)
    }

    /// Fail at setup time for declared-but-unimplemented backends
    pub fn ensure_implemented(&self) -> Result<(), ConfigError> {
        if self.is_implemented() {
            Ok(())
        } else {
            Err(ConfigError::Unsupported(self.as_str().into()))
        }
    }
}

impl std::str::FromStr for StorageType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            "rabbitmq" => Ok(Self::RabbitMq),
            "elasticsearch" => Ok(Self::Elasticsearch),
            other => Err(ConfigError::UnknownStorageType(other.into())),
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static connection parameters for one backend instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: Box<str>,
    pub storage_type: StorageType,
    #[serde(default)]
    pub host: Box<str>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: Box<str>,
    #[serde(default)]
    pub password: Box<str>,
    #[serde(default)]
    pub db_name: Box<str>,
    #[serde(default)]
    pub table: Box<str>,
    #[serde(default)]
    pub queue: Box<str>,
    #[serde(default)]
    pub routing_key: Box<str>,
    #[serde(default = "default_timeout_millis")]
    pub insert_timeout_millis: u64,
    #[serde(default = "default_timeout_millis")]
    pub read_timeout_millis: u64,
}

fn default_timeout_millis() -> u64 {
    5000
}

impl DriverConfig {
    pub fn new(name: &str, storage_type: StorageType) -> Self {
        Self {
            name: name.into(),
            storage_type,
            host: "".into(),
            port: 0,
            user: "".into(),
            password: "".into(),
            db_name: "".into(),
            table: "".into(),
            queue: "".into(),
            routing_key: "".into(),
            insert_timeout_millis: default_timeout_millis(),
            read_timeout_millis: default_timeout_millis(),
        }
    }

    pub fn insert_timeout(&self) -> Duration {
        Duration::from_millis(self.insert_timeout_millis)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_millis)
    }

    /// Fail on missing name or unimplemented backend
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingOption("driver name".into()));
        }
        self.storage_type.ensure_implemented()
    }
}

/// Identity of a driver within a transaction
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId {
    pub storage_type: StorageType,
    pub name: Box<str>,
}

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.storage_type, self.name)
    }
}

/// Adapter exposing begin/exec/commit/rollback/finish for one backend instance.
///
/// Every call is keyed by the caller's transaction ID. One driver instance
/// serves many concurrent transactions and isolates them by that ID.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Start background resources (connection checks, pools)
    async fn run(&self) -> Result<(), DriverError>;

    /// Release every resource held by the driver
    async fn stop(&self) -> Result<(), DriverError>;

    /// Open a backend transaction scoped to `tx_id`
    async fn begin(&self, tx_id: TransactionId) -> Result<(), DriverError>;

    /// Execute one statement inside the transaction opened for `tx_id`
    async fn exec(&self, request: &Request, tx_id: TransactionId) -> Result<(), DriverError>;

    /// Finalize the backend transaction
    async fn commit(&self, tx_id: TransactionId) -> Result<(), DriverError>;

    /// Best-effort undo.
    ///
    /// Must tolerate a transaction that was never begun, and must not panic
    /// when called after commit.
    async fn rollback(&self, tx_id: TransactionId) -> Result<(), DriverError>;

    /// Release anything tied to `tx_id`, whatever the outcome
    async fn finish_tx(&self, tx_id: TransactionId) -> Result<(), DriverError>;

    /// Backend technology, used to pick the request builder
    fn storage_type(&self) -> StorageType;

    /// Configured name, unique within a `DriverSet`
    fn name(&self) -> &str;

    /// Static connection parameters
    fn config(&self) -> &DriverConfig;

    fn id(&self) -> DriverId {
        DriverId {
            storage_type: self.storage_type(),
            name: self.name().into(),
        }
    }
}

/// Drivers indexed by name, one per configured backend
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: BTreeMap<Box<str>, Arc<dyn Driver>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(driver.name().into(), driver);
        self
    }

    /// Look up a driver by name; absence is a configuration error
    pub fn get(&self, name: &str) -> Result<&Arc<dyn Driver>, ConfigError> {
        self.drivers
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDriver(name.into()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Driver>> {
        self.drivers.values()
    }

    /// Run every driver
    pub async fn run_all(&self) -> Result<(), DriverError> {
        for driver in self.drivers.values() {
            driver.run().await?;
        }
        Ok(())
    }

    /// Stop every driver; errors are logged and the first is returned
    pub async fn stop_all(&self) -> Result<(), DriverError> {
        let mut first = None;
        for driver in self.drivers.values() {
            if let Err(e) = driver.stop().await {
                tracing::warn!(driver = %driver.name(), error = %e, "Driver stop failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
