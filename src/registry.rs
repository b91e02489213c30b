//! In-flight transaction registry

use crate::{TransactionId, TransactionSnapshot};

/// Registry of transactions currently owned by this process
pub trait TransactionRegistry: Send + Sync + 'static {
    /// Insert or replace the entry for the snapshot's ID
    fn put(&self, snapshot: TransactionSnapshot) -> Result<(), RegistryError>;
    /// Latest snapshot for `tx_id`, if tracked
    fn get(&self, tx_id: TransactionId) -> Option<TransactionSnapshot>;
    /// Evict; returns whether an entry was present
    fn remove(&self, tx_id: TransactionId) -> Result<bool, RegistryError>;
    /// IDs of every tracked transaction
    fn ids(&self) -> Vec<TransactionId>;

    fn len(&self) -> usize {
        self.ids().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry backend failure
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Storage error: {0}")]
    Storage(Box<str>),
}

/// Mutex-guarded in-memory registry
pub struct InMemoryRegistry {
    data: std::sync::Mutex<std::collections::HashMap<TransactionId, TransactionSnapshot>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            data: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl TransactionRegistry for InMemoryRegistry {
    fn put(&self, snapshot: TransactionSnapshot) -> Result<(), RegistryError> {
        let mut data = self.data.lock().map_err(|e| RegistryError::Storage(e.to_string().into()))?;
        data.insert(snapshot.id, snapshot);
        Ok(())
    }

    fn get(&self, tx_id: TransactionId) -> Option<TransactionSnapshot> {
        let data = self.data.lock().ok();
        data.and_then(|d| d.get(&tx_id).cloned())
    }

    fn remove(&self, tx_id: TransactionId) -> Result<bool, RegistryError> {
        let mut data = self.data.lock().map_err(|e| RegistryError::Storage(e.to_string().into()))?;
        Ok(data.remove(&tx_id).is_some())
    }

    fn ids(&self) -> Vec<TransactionId> {
        self.data
            .lock()
            .map(|d| d.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
