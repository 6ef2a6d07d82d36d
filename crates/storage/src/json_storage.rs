//! JSON file snapshot store.
//!
//! Keeps the snapshot in `<root>/progress.json`. Writes go to a temporary
//! file first and are renamed into place, so a crash mid-write leaves the
//! previous snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use super::{Result, Snapshot, SnapshotStore};

const SNAPSHOT_FILE: &str = "progress.json";
const TEMP_FILE: &str = "progress.json.tmp";

/// File-based JSON snapshot store.
pub struct JsonSnapshotStore {
    root: PathBuf,
}

impl JsonSnapshotStore {
    /// Create the store, creating `root` if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Path of the snapshot document.
    pub fn path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.root.join(TEMP_FILE)
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let json = snapshot.to_json_string()?;
        let temp = self.temp_path();
        fs::write(&temp, json.as_bytes()).await?;
        fs::rename(&temp, self.path()).await?;
        debug!("Saved {} progress records to {}", snapshot.records.len(), self.path().display());
        Ok(())
    }

    async fn load(&self) -> Result<Option<Snapshot>> {
        let json = match fs::read_to_string(self.path()).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let (snapshot, report) = Snapshot::from_json_str(&json)?;
        if !report.is_clean() {
            warn!(
                "Snapshot {} had {} corrupt records and {} corrupt pending lists",
                self.path().display(),
                report.skipped_records.len(),
                report.skipped_pending.len()
            );
        }
        Ok(Some(snapshot))
    }

    async fn clear(&self) -> Result<()> {
        fs::remove_file(self.path()).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packsync_core::{ItemId, PackId, ProgressRecord};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path()).await.unwrap();
        assert!(store.load().await.unwrap().is_none());

        let mut record = ProgressRecord::started(3, chrono::Utc::now());
        record.progress = 31.0;
        record.pending_mods.insert(ItemId::from("m1"));
        let mut records = BTreeMap::new();
        records.insert(PackId::from("pack"), record);

        store.save(&Snapshot::capture(records.iter())).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap().into_records();
        let record = &loaded[&PackId::from("pack")];
        assert_eq!(record.progress, 31.0);
        assert!(record.pending_mods.contains(&ItemId::from("m1")));
        assert!(!dir.path().join(TEMP_FILE).exists());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path()).await.unwrap();
        store.save(&Snapshot::default()).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::new(dir.path()).await.unwrap();
        tokio::fs::write(store.path(), b"\x00not json").await.unwrap();
        assert!(store.load().await.is_err());
    }
}
