//! Directory-backed store: one JSON document per key.

use super::{KvStore, StoreId, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// File-backed key-value store.
///
/// Each key maps to `<dir>/<encoded-key>.json`. Writes go to a temporary file
/// that is renamed over the target, so readers never observe a torn document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    id: StoreId,
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(id: impl Into<StoreId>, dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let store = Self { id: id.into(), dir };
        tracing::debug!(store = %store.id, dir = %store.dir.display(), "Opened file store");
        Ok(store)
    }

    /// Root directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

/// Encode a key into a file name that cannot collide with another key.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

#[async_trait]
impl KvStore for JsonFileStore {
    fn id(&self) -> &StoreId {
        &self.id
    }

    async fn read(&self, key: &str) -> StoreResult<Option<Value>> {
        let path = self.path_for(key);
        let content = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(serde_json::from_slice(&content)?))
    }

    async fn write(&self, key: &str, value: Value) -> StoreResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

        let content = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::trace!(store = %self.id, key = %key, "Wrote document");
        Ok(())
    }
}
