//! Error types for drivers, builders, configuration and the coordinator

use crate::{FieldType, RegistryError, RepositoryError, TransactionId, TransactionStatus};

/// Error returned by a storage driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Backend connection could not be established or was lost
    #[error("connection error: {0}")]
    Connection(Box<str>),
    /// Backend rejected the statement
    #[error("statement error: {0}")]
    Statement(Box<str>),
    /// No transaction is open for this ID on this driver
    #[error("transaction {0} was not begun")]
    NotBegun(TransactionId),
    /// A transaction is already open for this ID on this driver
    #[error("transaction {0} already begun")]
    AlreadyBegun(TransactionId),
    /// The call exceeded its per-operation timeout
    #[error("timed out after {0}ms")]
    Timeout(u64),
    /// The caller's cancellation token fired
    #[error("cancelled")]
    Cancelled,
}

/// Error building a request for a backend
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    /// Operation kind has no statement form for this backend
    #[error("unsupported operation kind: {0}")]
    UnsupportedOperation(Box<str>),
    /// Table or column name is not a plain identifier
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(Box<str>),
    /// Create/update need at least one value
    #[error("no values to write")]
    EmptyValues,
    /// Update/delete need the `id` value
    #[error("missing key field {0:?}")]
    MissingKey(Box<str>),
    /// Statement could not be encoded
    #[error("encode error: {0}")]
    Encode(Box<str>),
}

/// Inbound message does not match the operation's declared fields
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("field {field:?} is not a valid {}", expected.as_str())]
    WrongType { field: Box<str>, expected: FieldType },
    #[error("message has no fields")]
    Empty,
}

/// Setup-time configuration error; never retried
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Storage type string is not recognised
    #[error("unknown storage type: {0}")]
    UnknownStorageType(Box<str>),
    /// Operation kind string is not recognised
    #[error("unknown operation type: {0}")]
    UnknownOperationType(Box<str>),
    /// Storage type is declared but has no implementation
    #[error("storage type {0} is not supported")]
    Unsupported(Box<str>),
    /// Operation references a driver that was not registered
    #[error("unknown driver: {0}")]
    UnknownDriver(Box<str>),
    /// Two storages of one operation (or two requests of one transaction)
    /// name the same driver
    #[error("driver {0} is bound more than once")]
    DuplicateDriver(Box<str>),
    /// No builder registered for a storage type
    #[error("no request builder for storage type {0}")]
    MissingBuilder(Box<str>),
    /// A required option is absent or empty
    #[error("missing required option: {0}")]
    MissingOption(Box<str>),
}

/// Protocol phase in which a driver call failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Opening the backend transaction
    Begin,
    /// Executing the statement
    Exec,
    /// Committing the backend transaction
    Commit,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Begin => "begin",
            Phase::Exec => "exec",
            Phase::Commit => "commit",
        };
        f.write_str(s)
    }
}

/// Aggregated error returned by the coordinator's public entry points
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to build request: {0}")]
    Builder(#[from] BuilderError),
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),
    #[error("transaction {tx_id}: {phase} failed on driver {driver}: {source}")]
    Driver {
        tx_id: TransactionId,
        driver: Box<str>,
        phase: Phase,
        #[source]
        source: DriverError,
    },
    #[error("transaction {tx_id}: expected status {expected}, found {actual}")]
    InvalidStatus {
        tx_id: TransactionId,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },
    #[error("transaction {tx_id}: bookkeeping write failed: {source}")]
    Bookkeeping {
        tx_id: TransactionId,
        #[source]
        source: Box<CoordinatorError>,
    },
    #[error("transaction {tx_id}: replay failed: {source}")]
    Replay {
        tx_id: TransactionId,
        #[source]
        source: Box<CoordinatorError>,
    },
    #[error("transaction {tx_id}: {action} failed on {failures} driver(s)")]
    Cleanup {
        tx_id: TransactionId,
        action: &'static str,
        failures: usize,
    },
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("decode error: {0}")]
    Decode(Box<str>),
    #[error("transaction has no requests")]
    EmptyTransaction,
}

impl CoordinatorError {
    /// Driver name attached to a per-driver failure, if any
    pub fn failed_driver(&self) -> Option<&str> {
        match self {
            Self::Driver { driver, .. } => Some(driver.as_ref()),
            Self::Bookkeeping { source, .. } | Self::Replay { source, .. } => {
                source.failed_driver()
            }
            _ => None,
        }
    }

    /// Check if this is a setup-time configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
