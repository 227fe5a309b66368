//! In-memory backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{KeyValueStore, Namespace, PersistenceError, StorageKey};

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<BTreeMap<StorageKey, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryKeyValueStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put`/`delete` fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored values across all namespaces.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// No values stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), PersistenceError> {
        if !StorageKey::is_valid_name(&key.name) {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        self.check_writable()?;
        self.entries.write().insert(key.clone(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool, PersistenceError> {
        self.check_writable()?;
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .entries
            .read()
            .keys()
            .filter(|key| key.namespace == namespace)
            .map(|key| key.name.clone())
            .collect())
    }
}
