//! Progress store - the record map and its persistence.

use std::collections::BTreeMap;

use packsync_core::{PackId, ProgressRecord, Time};
use packsync_storage::{Snapshot, SnapshotStore, StorageError};
use tracing::{debug, warn};

use crate::debounce::PersistDebouncer;

/// Packs whose record needed repair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Repaired pack ids
    pub repaired: Vec<PackId>,
}

impl RepairReport {
    /// Whether nothing needed fixing.
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
    }
}

/// In-memory map of pack id to progress record.
///
/// Progress values are only written by the arbiter; everything else in the
/// crate may adjust counters but goes through the arbiter for `progress`.
#[derive(Debug)]
pub struct ProgressStore {
    records: BTreeMap<PackId, ProgressRecord>,
    debouncer: PersistDebouncer,
}

impl ProgressStore {
    /// Create an empty store with the given persist quiet period.
    pub fn new(persist_debounce: chrono::Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            debouncer: PersistDebouncer::new(persist_debounce),
        }
    }

    /// Cap how long a continuous stream of updates can hold back a write.
    pub fn with_max_wait(mut self, max_wait: chrono::Duration) -> Self {
        self.debouncer = self.debouncer.with_max_wait(max_wait);
        self
    }

    /// Record of a pack.
    pub fn get(&self, id: &PackId) -> Option<&ProgressRecord> {
        self.records.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &PackId) -> Option<&mut ProgressRecord> {
        self.records.get_mut(id)
    }

    /// Insert or replace a record.
    pub fn upsert(&mut self, id: PackId, record: ProgressRecord) {
        self.records.insert(id, record);
    }

    /// Remove a record.
    pub fn remove(&mut self, id: &PackId) -> Option<ProgressRecord> {
        self.records.remove(id)
    }

    /// Iterate all records.
    pub fn iter(&self) -> impl Iterator<Item = (&PackId, &ProgressRecord)> {
        self.records.iter()
    }

    /// Ids of packs marked downloading.
    pub fn downloading_ids(&self) -> Vec<PackId> {
        self.records
            .iter()
            .filter(|(_, r)| r.downloading)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether any pack is marked downloading.
    pub fn has_downloading(&self) -> bool {
        self.records.values().any(|r| r.downloading)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace unusable values with safe defaults.
    ///
    /// Non-finite progress becomes 0, a zero denominator becomes 1, progress
    /// is clamped into `[0, 100]`. Never fails.
    pub fn validate_and_repair(&mut self) -> RepairReport {
        let mut report = RepairReport::default();
        for (id, record) in self.records.iter_mut() {
            let mut repaired = false;
            if !record.progress.is_finite() {
                record.progress = 0.0;
                repaired = true;
            }
            if record.total_mods == 0 {
                record.total_mods = 1;
                repaired = true;
            }
            let clamped = record.progress.clamp(0.0, 100.0);
            if clamped != record.progress {
                record.progress = clamped;
                repaired = true;
            }
            if repaired {
                report.repaired.push(id.clone());
            }
        }
        if !report.is_clean() {
            warn!("Repaired {} progress records", report.repaired.len());
        }
        report
    }

    /// Capture the current state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(self.records.iter())
    }

    /// Replace the current state with a snapshot, then repair it.
    pub fn restore_snapshot(&mut self, snapshot: Snapshot) -> RepairReport {
        self.records = snapshot.into_records();
        self.validate_and_repair()
    }

    /// Schedule a write once the current burst of updates settles.
    pub fn debounced_persist(&mut self, now: Time) {
        self.debouncer.touch(now);
    }

    /// Whether a debounced write is due.
    pub fn persist_due(&self, now: Time) -> bool {
        self.debouncer.is_due(now)
    }

    /// Whether a debounced write is owed.
    pub fn persist_pending(&self) -> bool {
        self.debouncer.is_armed()
    }

    /// Write the full snapshot now. A failed write stays owed and is
    /// retried by the next [`flush_if_due`](Self::flush_if_due).
    pub async fn persist(&mut self, store: &dyn SnapshotStore) -> Result<(), StorageError> {
        let snapshot = self.snapshot();
        store.save(&snapshot).await?;
        self.debouncer.disarm();
        debug!("Persisted {} progress records", snapshot.records.len());
        Ok(())
    }

    /// Write the snapshot if the debounce period has elapsed. Returns whether it wrote.
    pub async fn flush_if_due(
        &mut self,
        now: Time,
        store: &dyn SnapshotStore,
    ) -> Result<bool, StorageError> {
        if !self.persist_due(now) {
            return Ok(false);
        }
        self.persist(store).await?;
        Ok(true)
    }

    /// Load the stored snapshot, replacing the current state.
    ///
    /// Missing snapshots leave the store empty. The loaded state is always
    /// repaired before use.
    pub async fn restore(&mut self, store: &dyn SnapshotStore) -> Result<RepairReport, StorageError> {
        match store.load().await? {
            Some(snapshot) => Ok(self.restore_snapshot(snapshot)),
            None => {
                self.records.clear();
                Ok(RepairReport::default())
            }
        }
    }
}
