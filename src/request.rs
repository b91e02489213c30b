//! Backend requests and the builders that produce them

use crate::{BuilderError, ConfigError, StorageType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Raw inbound message: field name to JSON value
pub type RawMessage = serde_json::Map<String, serde_json::Value>;

/// A single statement parameter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(chrono::DateTime<chrono::Utc>),
    Json(serde_json::Value),
}

impl Arg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&serde_json::Value> for Arg {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Arg::Null,
            Value::Bool(b) => Arg::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Arg::Int(i),
                None => Arg::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Arg::Text(s.clone()),
            other => Arg::Json(other.clone()),
        }
    }
}

/// A backend statement ready for `Driver::exec`.
///
/// Opaque to the coordinator; only the driver interprets `value` and `args`.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Backend-specific statement
    pub value: String,
    /// Backend-specific parameters
    pub args: Vec<Arg>,
    /// The originating value map
    pub raw: RawMessage,
}

/// Kind of mutation an operation performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    DeleteAll,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DeleteAll => "delete_all",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "delete_all" => Ok(Self::DeleteAll),
            other => Err(ConfigError::UnknownOperationType(other.into())),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the key column used by update and delete statements
pub const KEY_FIELD: &str = "id";

/// Everything a builder needs to produce one request.
///
/// Constructed once per request; `RequestBuilder::build` is the only
/// effectful step.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub table: Box<str>,
    pub kind: OperationKind,
    pub values: BTreeMap<String, Arg>,
    pub raw: RawMessage,
}

impl RequestSpec {
    pub fn new(table: &str, kind: OperationKind) -> Self {
        Self {
            table: table.into(),
            kind,
            values: BTreeMap::new(),
            raw: RawMessage::new(),
        }
    }

    /// Take values from a raw message, keeping the message as `raw`
    pub fn with_message(mut self, raw: &RawMessage) -> Self {
        self.values = raw.iter().map(|(k, v)| (k.clone(), Arg::from(v))).collect();
        self.raw = raw.clone();
        self
    }

    pub fn with_value(mut self, column: &str, value: Arg) -> Self {
        self.values.insert(column.to_string(), value);
        self
    }

    /// Key value for update/delete
    pub fn key(&self) -> Result<&Arg, BuilderError> {
        self.values
            .get(KEY_FIELD)
            .ok_or_else(|| BuilderError::MissingKey(KEY_FIELD.into()))
    }
}

/// Produces backend requests; one implementation per storage type
pub trait RequestBuilder: Send + Sync + 'static {
    fn storage_type(&self) -> StorageType;

    fn build(&self, spec: &RequestSpec) -> Result<Request, BuilderError>;
}

/// Builders indexed by storage type
#[derive(Clone, Default)]
pub struct BuilderRegistry {
    builders: HashMap<StorageType, Arc<dyn RequestBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, builder: Arc<dyn RequestBuilder>) -> Self {
        self.builders.insert(builder.storage_type(), builder);
        self
    }

    /// Look up the builder for a storage type; absence is a configuration error
    pub fn get(&self, storage_type: StorageType) -> Result<&Arc<dyn RequestBuilder>, ConfigError> {
        self.builders
            .get(&storage_type)
            .ok_or_else(|| ConfigError::MissingBuilder(storage_type.as_str().into()))
    }
}

/// Reject anything but plain (optionally schema-qualified) identifiers
pub(crate) fn check_identifier(name: &str) -> Result<(), BuilderError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with('.')
        && !name.ends_with('.');
    if valid {
        Ok(())
    } else {
        Err(BuilderError::InvalidIdentifier(name.into()))
    }
}
