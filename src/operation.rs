//! Operation configuration and its fingerprint

use crate::{ConfigError, OperationKind, RawMessage, ValidationError};
use serde_json::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Declared type of a message field
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Uuid,
    Timestamp,
    Json,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Uuid => "uuid",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        }
    }

    /// Whether a non-null JSON value has this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Uuid => value.as_str().is_some_and(|s| uuid::Uuid::parse_str(s).is_ok()),
            Self::Timestamp => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Json => true,
        }
    }
}

/// A storage an operation writes to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBinding {
    /// Registered driver name
    pub driver: Box<str>,
    /// Target table (or index/queue for non-relational backends)
    pub table: Box<str>,
}

/// A configured unit of work mapping a message shape to its storages
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationConfig {
    pub name: Box<str>,
    pub kind: OperationKind,
    pub storages: Vec<StorageBinding>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldType>,
    /// Per-call timeout applied to each exec and commit
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
}

fn default_timeout_millis() -> u64 {
    30_000
}

/// Deterministic digest of an operation's storages, fields and kind
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHash(pub Vec<u8>);

impl OperationHash {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for OperationHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperationHash(")?;
        for b in self.0.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    kind: OperationKind,
    storages: &'a [StorageBinding],
    fields: &'a BTreeMap<String, FieldType>,
}

impl OperationConfig {
    pub fn new(name: &str, kind: OperationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            storages: Vec::new(),
            fields: BTreeMap::new(),
            timeout_millis: default_timeout_millis(),
        }
    }

    pub fn with_storage(mut self, driver: &str, table: &str) -> Self {
        self.storages.push(StorageBinding {
            driver: driver.into(),
            table: table.into(),
        });
        self
    }

    pub fn with_field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.insert(name.to_string(), field_type);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_millis = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    /// Fingerprint recomputed from kind, storages and fields.
    ///
    /// Changing the name or timeout does not change the hash.
    pub fn hash(&self) -> OperationHash {
        let input = HashInput {
            kind: self.kind,
            storages: &self.storages,
            fields: &self.fields,
        };
        // Serializing plain structs and a BTreeMap cannot fail.
        let encoded = serde_json::to_vec(&input).unwrap_or_default();
        OperationHash(Sha256::digest(&encoded).to_vec())
    }

    /// Type-check the declared fields present in `raw`.
    ///
    /// Nulls and undeclared fields pass; an operation without declared
    /// fields accepts any message.
    pub fn check_message(&self, raw: &RawMessage) -> Result<(), ValidationError> {
        for (name, field_type) in &self.fields {
            match raw.get(name) {
                None | Some(Value::Null) => {}
                Some(value) if field_type.accepts(value) => {}
                Some(_) => {
                    return Err(ValidationError::WrongType {
                        field: name.as_str().into(),
                        expected: *field_type,
                    })
                }
            }
        }
        if self.kind != OperationKind::DeleteAll && raw.is_empty() {
            return Err(ValidationError::Empty);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingOption("operation name".into()));
        }
        if self.storages.is_empty() {
            return Err(ConfigError::MissingOption(
                format!("storages for operation {}", self.name).into(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for binding in &self.storages {
            if !seen.insert(binding.driver.as_ref()) {
                return Err(ConfigError::DuplicateDriver(binding.driver.clone()));
            }
        }
        Ok(())
    }
}
