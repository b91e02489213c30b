//! Unit-of-Work Coordinator for Heterogeneous Storage Drivers
//!
//! Applies message-driven mutations across several storage backends as one
//! transaction. There is no cross-backend two-phase commit: consistency comes
//! from a durable record of every in-flight transaction in a system store,
//! written through the same begin/exec/commit protocol as user data, and
//! replayed (or canceled on configuration drift) at startup.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Register drivers and the builders for their storage types
//! let store = MemoryStore::new();
//! let drivers = DriverSet::new().register(Arc::new(MemoryDriver::new("main", store.clone())));
//! let builders = BuilderRegistry::new().register(Arc::new(MemoryBuilder));
//!
//! // 2. Point the system store at its own driver and repository
//! let system = SystemStore {
//!     driver: Arc::new(MemoryDriver::new("system", store.clone())),
//!     builder: Arc::new(MemoryBuilder),
//!     repository: Arc::new(MemoryRepository::new(store)),
//! };
//!
//! // 3. Build the service for one operation
//! let operation = OperationConfig::new("create_user", OperationKind::Create)
//!     .with_storage("main", "users");
//! let service = Service::new(ServiceConfig::new(InstanceId(1)), operation, drivers, builders, system)?;
//!
//! // 4. Recover, then handle messages
//! let cancel = CancellationToken::new();
//! service.load_on_startup(&cancel).await?;
//! service.handle_message(&cancel, raw).await?;
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod errors;
mod ids;
mod operation;
mod request;
mod status;
mod transaction;

// === Drivers ===
mod driver;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;

// === System Store ===
mod models;
mod registry;
mod repository;

// === Coordination ===
mod config;
mod coordinator;
mod recovery;

// === Observability ===
mod metrics;

// === Test Harness ===
#[cfg(any(test, feature = "test-harness"))]
pub mod testing;

// === Re-exports ===

// Types
pub use ids::{InstanceId, TransactionId};
pub use operation::{FieldType, OperationConfig, OperationHash, StorageBinding};
pub use request::{
    Arg, BuilderRegistry, OperationKind, RawMessage, Request, RequestBuilder, RequestSpec, KEY_FIELD,
};
pub use status::{TransactionRole, TransactionStatus};
pub use transaction::{Participant, Transaction, TransactionHeader, TransactionSnapshot};

// Errors
pub use errors::{BuilderError, ConfigError, CoordinatorError, DriverError, Phase, ValidationError};

// Drivers
pub use driver::{Driver, DriverConfig, DriverId, DriverSet, StorageType};
pub use memory::{MemoryBuilder, MemoryDriver, MemoryRepository, MemoryStatement, MemoryStore, Row};
#[cfg(feature = "postgres")]
pub use postgres::{connection_string, PostgresBuilder, PostgresDriver, PostgresRepository};

// System store
pub use models::{RequestModel, TransactionModel, REQUESTS_TABLE, TRANSACTIONS_TABLE};
pub use registry::{InMemoryRegistry, RegistryError, TransactionRegistry};
pub use repository::{in_progress_filter, Fields, RepositoryError, TransactionRepository, FILTER_COLUMNS};

// Coordination
pub use config::{FailurePolicy, RecoveryConfig, ServiceConfig};
pub use coordinator::{Service, SystemStore};
pub use recovery::RecoveryReport;

// Observability
pub use metrics::{MetricsCounter, NoOpMetrics, TransactionStats, TransactionStatsSnapshot};
