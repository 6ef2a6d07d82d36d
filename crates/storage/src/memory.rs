//! In-memory snapshot store.
//!
//! Holds the encoded JSON text rather than the struct, so saving and
//! loading go through exactly the same encoding as the file store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Result, Snapshot, SnapshotStore};

/// Snapshot store that never touches the filesystem.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    document: Arc<Mutex<Option<String>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a raw document, e.g. a deliberately corrupt one.
    pub async fn put_raw(&self, json: impl Into<String>) {
        *self.document.lock().await = Some(json.into());
    }

    /// Raw document currently stored.
    pub async fn raw(&self) -> Option<String> {
        self.document.lock().await.clone()
    }

    /// How many times `save` was called.
    pub async fn save_count(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let json = snapshot.to_json_string()?;
        *self.document.lock().await = Some(json);
        *self.saves.lock().await += 1;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        let Some(json) = self.document.lock().await.clone() else {
            return Ok(None);
        };
        let (snapshot, _report) = Snapshot::from_json_str(&json)?;
        Ok(Some(snapshot))
    }

    async fn clear(&self) -> Result<()> {
        *self.document.lock().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip_counts_saves() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&Snapshot::default()).await.unwrap();
        store.save(&Snapshot::default()).await.unwrap();
        assert_eq!(store.save_count().await, 2);
        assert!(store.load().await.unwrap().is_some());
        store.clear().await.unwrap();
        assert!(store.raw().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_partial_corruption() {
        let store = MemorySnapshotStore::new();
        store
            .put_raw(r#"{"records": {"a": {"downloading": true, "total_mods": 2}, "b": 5}}"#)
            .await;
        let snapshot = store.load().await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 1);
    }
}
