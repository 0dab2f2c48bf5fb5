//! In-process store backed by a map.

use super::{KvStore, StoreId, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory key-value store for hosts without persistence and for testing.
///
/// Clones share the same underlying map and identity.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    id: StoreId,
    entries: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStore {
    /// Create an empty store with the given identity.
    pub fn new(id: impl Into<StoreId>) -> Self {
        Self {
            id: id.into(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn id(&self) -> &StoreId {
        &self.id
    }

    async fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: Value) -> StoreResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_write() {
        let store = MemoryStore::new("test");
        assert!(store.is_empty().await);
        assert!(store.read("k").await.unwrap().is_none());

        store.write("k", json!([1, 2])).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = MemoryStore::new("test");
        let clone = store.clone();
        clone.write("k", json!("v")).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Some(json!("v")));
        assert_eq!(store.id(), clone.id());
    }
}
