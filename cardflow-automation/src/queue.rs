//! Serialized read-modify-write over a [`KvStore`].
//!
//! The store only offers independent `read` and `write`. Callers that need to
//! change a stored list (UI moves, retry clears, the automation engine) go
//! through [`MutationQueue::mutate`], which runs `read → updater → write` as one
//! critical section per `(store identity, key)` slot.
//!
//! # Ordering
//!
//! - Same slot: strictly in arrival order. Arrival is the moment the returned
//!   future is first polled; the slot mutex is fair, so waiters are granted
//!   the slot in the order they queued.
//! - Different keys or different store identities: fully parallel, no
//!   relative ordering.
//!
//! # Failure
//!
//! An updater error is returned to the caller and nothing is written. The
//! slot is released on every exit path, including cancellation, so later
//! callers proceed.

use crate::store::{KvStore, StoreError, StoreId, StoreResult};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Composite slot identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    store: StoreId,
    key: String,
}

type Slot = Arc<Mutex<()>>;

/// Keeps a slot alive while a caller holds or waits on it and reclaims the
/// map entry once nobody does.
struct SlotLease<'a> {
    slots: &'a DashMap<SlotKey, Slot>,
    key: SlotKey,
    slot: Slot,
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        // Map + this lease are the only owners left.
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) <= 2);
    }
}

/// Per-(store, key) FIFO mutex for atomic list updates.
#[derive(Default)]
pub struct MutationQueue {
    slots: DashMap<SlotKey, Slot>,
}

impl MutationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots currently held or waited on.
    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    /// Atomically replace the list under `key` with `updater(current)`.
    ///
    /// `current` is empty when the key is absent or holds a non-array value.
    /// Returns the updater's result after it has been written.
    pub async fn mutate<T, F, E>(&self, store: &dyn KvStore, key: &str, updater: F) -> Result<Vec<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<T>) -> Result<Vec<T>, E>,
        E: From<StoreError>,
    {
        self.mutate_async(store, key, |current| std::future::ready(updater(current)))
            .await
    }

    /// Like [`mutate`](Self::mutate) with an asynchronous updater.
    ///
    /// The slot stays held while the updater's future runs.
    pub async fn mutate_async<T, F, Fut, E>(
        &self,
        store: &dyn KvStore,
        key: &str,
        updater: F,
    ) -> Result<Vec<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
        E: From<StoreError>,
    {
        let lease = self.lease(store.id(), key);
        let _guard = match lease.slot.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::trace!(store = %store.id(), key = %key, "Waiting for mutation slot");
                lease.slot.lock().await
            }
        };

        let current = read_list(store, key).await?;
        let next = updater(current).await?;

        let encoded = serde_json::to_value(&next).map_err(StoreError::from)?;
        store.write(key, encoded).await?;

        Ok(next)
    }

    /// Read and decode the list under `key` without taking the slot.
    ///
    /// Uses the same defaulting as `mutate`. The result may be stale by the
    /// time it is used; decisions that must be atomic belong in an updater.
    pub async fn snapshot<T>(&self, store: &dyn KvStore, key: &str) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        read_list(store, key).await
    }

    fn lease(&self, store: &StoreId, key: &str) -> SlotLease<'_> {
        let slot_key = SlotKey {
            store: store.clone(),
            key: key.to_string(),
        };
        let slot = self.slots.entry(slot_key.clone()).or_default().clone();

        SlotLease {
            slots: &self.slots,
            key: slot_key,
            slot,
        }
    }
}

async fn read_list<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> StoreResult<Vec<T>> {
    decode_list(store.read(key).await?)
}

fn decode_list<T: DeserializeOwned>(value: Option<Value>) -> StoreResult<Vec<T>> {
    match value {
        Some(items @ Value::Array(_)) => Ok(serde_json::from_value(items)?),
        _ => Ok(Vec::new()),
    }
}
