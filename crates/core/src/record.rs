//! Progress record - the per-pack state behind one progress bar.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Deserializer, Serialize};

use crate::id::ItemId;
use crate::math;
use crate::Time;

/// Which signal last wrote a record's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    /// Raw byte counters of in-flight transfers
    TransferEvents,
    /// Queue "done" notices
    QueueCompletion,
    /// An item finished transferring (not active yet)
    ItemDownloaded,
    /// Activation count pushed or polled from the backend
    StatusPush,
    /// Periodic authoritative resync
    #[default]
    BackendSync,
    /// Terminal transition, every item active
    Completion,
    /// Every item transferred, waiting for activation
    AllDownloaded,
}

impl UpdateSource {
    /// Coarse sources only know item counts, not bytes.
    pub fn is_coarse(self) -> bool {
        matches!(self, UpdateSource::StatusPush | UpdateSource::BackendSync)
    }

    /// Get string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateSource::TransferEvents => "transfer_events",
            UpdateSource::QueueCompletion => "queue_completion",
            UpdateSource::ItemDownloaded => "item_downloaded",
            UpdateSource::StatusPush => "status_push",
            UpdateSource::BackendSync => "backend_sync",
            UpdateSource::Completion => "completion",
            UpdateSource::AllDownloaded => "all_downloaded",
        }
    }
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Items whose transfer finished but which are not active yet.
///
/// Insertion ordered and duplicate free. Activation is assumed FIFO, so
/// graduations are taken from the front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingItems(VecDeque<ItemId>);

impl PendingItems {
    /// Append `item` unless it is already pending. Returns whether it was added.
    pub fn insert(&mut self, item: ItemId) -> bool {
        if self.0.contains(&item) {
            return false;
        }
        self.0.push_back(item);
        true
    }

    /// Remove a specific item. Returns whether it was present.
    pub fn remove(&mut self, item: &ItemId) -> bool {
        match self.0.iter().position(|i| i == item) {
            Some(pos) => {
                self.0.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Take up to `n` of the oldest pending items.
    pub fn pop_oldest(&mut self, n: usize) -> Vec<ItemId> {
        let n = n.min(self.0.len());
        self.0.drain(..n).collect()
    }

    /// Whether `item` is pending.
    pub fn contains(&self, item: &ItemId) -> bool {
        self.0.contains(item)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ItemId> {
        self.0.iter()
    }

    /// Pending count as used by the progress formula.
    pub fn count(&self) -> u32 {
        u32::try_from(self.0.len()).unwrap_or(u32::MAX)
    }
}

impl FromIterator<ItemId> for PendingItems {
    fn from_iter<T: IntoIterator<Item = ItemId>>(iter: T) -> Self {
        let mut pending = PendingItems::default();
        for item in iter {
            pending.insert(item);
        }
        pending
    }
}

/// Progress of one pack that is currently being worked on.
///
/// `pending_mods` is not serialized with the record: snapshots keep the
/// pending lists in their own map next to the records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Whether the pack is an active unit of work
    #[serde(default)]
    pub downloading: bool,

    /// Displayed percentage in `[0, 100]`
    #[serde(default, deserialize_with = "lenient_f64")]
    pub progress: f64,

    /// Items confirmed active
    #[serde(default, deserialize_with = "lenient_count")]
    pub completed_mods: u32,

    /// Items transferred but not confirmed active
    #[serde(skip)]
    pub pending_mods: PendingItems,

    /// Denominator, at least 1 once repaired
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_mods: u32,

    /// Items currently mid-transfer
    #[serde(default, deserialize_with = "lenient_count")]
    pub active_downloads: u32,

    /// Signal that last wrote `progress`
    #[serde(default)]
    pub last_update_source: UpdateSource,

    /// When `progress` was last written
    #[serde(default)]
    pub last_update_time: Time,

    /// Items known to be active, so repeated completion notices count once
    #[serde(default)]
    pub activated: BTreeSet<ItemId>,
}

impl ProgressRecord {
    /// Fresh record for a pack that just started downloading.
    pub fn started(total_mods: u32, now: Time) -> Self {
        Self {
            downloading: true,
            progress: 0.0,
            completed_mods: 0,
            pending_mods: PendingItems::default(),
            total_mods: total_mods.max(1),
            active_downloads: 0,
            last_update_source: UpdateSource::BackendSync,
            last_update_time: now,
            activated: BTreeSet::new(),
        }
    }

    /// Weighted progress derived from the counters.
    pub fn derived_progress(&self) -> u32 {
        math::weighted_progress(self.completed_mods, self.pending_mods.count(), self.total_mods)
    }

    /// Every item confirmed active.
    pub fn is_complete(&self) -> bool {
        self.completed_mods >= self.total_mods.max(1)
    }

    /// Every item either active or waiting for activation.
    pub fn all_transferred(&self) -> bool {
        let accounted = u64::from(self.completed_mods) + self.pending_mods.len() as u64;
        accounted >= u64::from(self.total_mods.max(1))
    }
}

/// Numbers that are missing, null or not numbers at all become NaN so
/// that repair can tell them apart from a real 0.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    })
}

/// Counters written by a buggy producer may be negative, fractional or
/// null. Anything unusable becomes 0.
fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let n = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(match n {
        Some(n) if n.is_finite() && n > 0.0 => n.floor().min(f64::from(u32::MAX)) as u32,
        _ => 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_items_insert_is_idempotent() {
        let mut pending = PendingItems::default();
        assert!(pending.insert("a".into()));
        assert!(!pending.insert("a".into()));
        assert!(pending.insert("b".into()));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_pending_items_pop_oldest_first() {
        let mut pending: PendingItems = ["a", "b", "c"].into_iter().map(ItemId::from).collect();
        assert_eq!(pending.pop_oldest(2), vec![ItemId::from("a"), ItemId::from("b")]);
        assert_eq!(pending.pop_oldest(5), vec![ItemId::from("c")]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_items_from_iter_dedupes() {
        let pending: PendingItems = ["a", "a", "b"].into_iter().map(ItemId::from).collect();
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_started_record_clamps_total() {
        let record = ProgressRecord::started(0, Time::default());
        assert_eq!(record.total_mods, 1);
        assert!(record.downloading);
        assert_eq!(record.derived_progress(), 0);
    }

    #[test]
    fn test_record_completion_predicates() {
        let mut record = ProgressRecord::started(3, Time::default());
        record.completed_mods = 1;
        record.pending_mods.insert("x".into());
        assert!(!record.all_transferred());
        record.pending_mods.insert("y".into());
        assert!(record.all_transferred());
        assert!(!record.is_complete());
        record.completed_mods = 3;
        assert!(record.is_complete());
    }

    #[test]
    fn test_lenient_deserialize_null_progress() {
        let json = r#"{"downloading": true, "progress": null, "completed_mods": -3, "total_mods": "4"}"#;
        let record: ProgressRecord = serde_json::from_str(json).unwrap();
        assert!(record.progress.is_nan());
        assert_eq!(record.completed_mods, 0);
        assert_eq!(record.total_mods, 4);
        assert_eq!(record.last_update_source, UpdateSource::BackendSync);
    }

    #[test]
    fn test_lenient_deserialize_missing_fields() {
        let record: ProgressRecord = serde_json::from_str("{}").unwrap();
        assert!(!record.downloading);
        assert_eq!(record.total_mods, 0);
        assert!(record.activated.is_empty());
    }

    #[test]
    fn test_pending_not_serialized_with_record() {
        let mut record = ProgressRecord::started(2, Time::default());
        record.pending_mods.insert("a".into());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("pending_mods").is_none());
        assert_eq!(json["last_update_source"], "backend_sync");
    }

    #[test]
    fn test_source_coarseness() {
        assert!(UpdateSource::StatusPush.is_coarse());
        assert!(UpdateSource::BackendSync.is_coarse());
        assert!(!UpdateSource::TransferEvents.is_coarse());
        assert!(!UpdateSource::Completion.is_coarse());
    }
}
