//! Key-value storage interface.
//!
//! The engine persists boards, cards and automation runs through a store
//! whose only operations are independent `read(key)` and `write(key, value)`.
//! There is no compare-and-swap; atomic read-modify-write is provided on top
//! by [`MutationQueue`](crate::queue::MutationQueue).
//!
//! Every store carries a [`StoreId`] token. The queue keys its slots by
//! `(StoreId, key)`, so two logically different stores (e.g. "committed" and
//! "local" card storage) never share a slot even when their keys collide.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use cardflow_common::config::{StorageBackend, StorageConfig};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Store Identity
// ============================================================================

/// Identity token carried by a store handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(String);

impl StoreId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StoreId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Trait for key-value store implementations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Identity token used to separate mutation slots.
    fn id(&self) -> &StoreId;

    /// Read the value stored under `key`, if any.
    async fn read(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Replace the value stored under `key`.
    async fn write(&self, key: &str, value: Value) -> StoreResult<()>;
}

/// Open a store for the configured backend.
pub async fn open_store(config: &StorageConfig) -> StoreResult<Arc<dyn KvStore>> {
    let id = StoreId::new(config.store_id.clone());
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new(id))),
        StorageBackend::File => {
            let store = JsonFileStore::open(id, config.data_dir()).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(&StorageConfig::default()).await.unwrap();
        assert_eq!(store.id().as_str(), "committed");
        assert!(store.read("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_file_store() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::File,
            data_dir: Some(tmp.path().join("data")),
            store_id: "local".into(),
        };

        let store = open_store(&config).await.unwrap();
        store.write("cards:b1", serde_json::json!([])).await.unwrap();
        assert_eq!(store.id(), &StoreId::from("local"));
        assert!(tmp.path().join("data").exists());
    }
}
