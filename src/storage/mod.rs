//! Process-wide key-value state.
//!
//! Breaker state, cache counters and usage aggregates live behind the
//! [`StateStore`] trait so they can be shared between concurrent requests and,
//! with the SQLite backend, survive restarts.
//!
//! Values are JSON. Every read-modify-write goes through [`StateStore::update`],
//! which implementations execute atomically per key.

pub mod database;
pub mod memory;

use std::sync::Arc;

use serde_json::Value;

use crate::config::{StorageBackend, StorageConfig};
use crate::types::Result;

pub use database::{PoolConfig, SqliteStateStore};
pub use memory::MemoryStateStore;

/// Shared state store handle for async contexts.
pub type SharedStateStore = Arc<dyn StateStore>;

/// Atomic key-value store for process-wide mutable state
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn set(&self, key: &str, value: Value) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically replace the value at `key` with `f(current)` and return it.
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<Value>) -> Value) -> Result<Value>;

    /// All keys starting with `prefix`, in ascending order
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically add `by` to an integer counter, returning the new value
    fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let updated = self.update(key, &mut |current| {
            let n = current.as_ref().and_then(Value::as_i64).unwrap_or(0);
            Value::from(n + by)
        })?;
        Ok(updated.as_i64().unwrap_or(0))
    }

    /// Read an integer counter (0 when absent)
    fn get_i64(&self, key: &str) -> Result<i64> {
        Ok(self.get(key)?.and_then(|v| v.as_i64()).unwrap_or(0))
    }

    /// Read a float accumulator (0.0 when absent)
    fn get_f64(&self, key: &str) -> Result<f64> {
        Ok(self.get(key)?.and_then(|v| v.as_f64()).unwrap_or(0.0))
    }
}

/// Build the configured state store
pub fn create_state_store(config: &StorageConfig) -> Result<SharedStateStore> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStateStore::new())),
        StorageBackend::Sqlite => {
            if let Some(parent) = config.path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteStateStore::open(&config.path)?;
            store.initialize()?;
            tracing::info!(path = %config.path.display(), "Using SQLite state store");
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_create_memory_store() {
        let store = create_state_store(&StorageConfig::default()).unwrap();
        assert_eq!(store.increment("n", 2).unwrap(), 2);
        assert_eq!(store.get_i64("n").unwrap(), 2);
        assert_eq!(store.get_f64("missing").unwrap(), 0.0);
    }

    #[test]
    fn test_create_sqlite_store_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("nested").join("state.db");
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
            path: path.clone(),
        };
        let store = create_state_store(&config).unwrap();
        store.set("k", Value::from("v")).unwrap();
        assert!(path.exists());
    }
}
