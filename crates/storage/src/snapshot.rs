//! Persisted snapshot layout.
//!
//! Two maps keyed by pack id, written as one document:
//!
//! ```text
//! {
//!   "version": 1,
//!   "saved_at": "...",
//!   "records": { "<pack>": { progress record } },
//!   "pending": { "<pack>": ["<item>", ...] }
//! }
//! ```
//!
//! Decoding is per key. A corrupt record or pending list is skipped and
//! counted; it never prevents the other entries from loading.

use std::collections::BTreeMap;

use chrono::Utc;
use packsync_core::{ItemId, PackId, PendingItems, ProgressRecord, Time};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::trait_::{Result, StorageError};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Progress records plus their pending lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version
    pub version: u32,

    /// When the snapshot was taken
    pub saved_at: Time,

    /// Progress record per pack
    pub records: BTreeMap<PackId, ProgressRecord>,

    /// Pending item ids per pack, oldest first
    pub pending: BTreeMap<PackId, Vec<ItemId>>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            records: BTreeMap::new(),
            pending: BTreeMap::new(),
        }
    }
}

/// What was dropped while decoding a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Records that could not be decoded
    pub skipped_records: Vec<PackId>,
    /// Pending lists that could not be decoded
    pub skipped_pending: Vec<PackId>,
}

impl LoadReport {
    /// Whether every entry decoded.
    pub fn is_clean(&self) -> bool {
        self.skipped_records.is_empty() && self.skipped_pending.is_empty()
    }
}

impl Snapshot {
    /// Capture records, moving each record's pending list into its own map.
    pub fn capture<'a>(records: impl IntoIterator<Item = (&'a PackId, &'a ProgressRecord)>) -> Self {
        let mut snapshot = Snapshot::default();
        for (id, record) in records {
            if !record.pending_mods.is_empty() {
                snapshot
                    .pending
                    .insert(id.clone(), record.pending_mods.iter().cloned().collect());
            }
            snapshot.records.insert(id.clone(), record.clone());
        }
        snapshot
    }

    /// Records with their pending lists joined back in.
    ///
    /// Pending lists without a matching record are dropped.
    pub fn into_records(self) -> BTreeMap<PackId, ProgressRecord> {
        let Snapshot {
            mut records,
            mut pending,
            ..
        } = self;
        for (id, record) in records.iter_mut() {
            if let Some(items) = pending.remove(id) {
                record.pending_mods = items.into_iter().collect::<PendingItems>();
            }
        }
        records
    }

    /// Encode as pretty JSON. Non-finite numbers are written as `null`.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decode a snapshot, tolerating corrupt entries.
    pub fn from_json_str(json: &str) -> Result<(Self, LoadReport)> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let serde_json::Value::Object(mut root) = value else {
            return Err(StorageError::Corrupt("top level is not an object".to_string()));
        };

        let mut report = LoadReport::default();
        let mut snapshot = Snapshot {
            version: root
                .get("version")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(SNAPSHOT_VERSION),
            saved_at: root
                .get("saved_at")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            records: BTreeMap::new(),
            pending: BTreeMap::new(),
        };

        if let Some(serde_json::Value::Object(records)) = root.remove("records") {
            for (key, value) in records {
                let id = PackId::new(key);
                match serde_json::from_value::<ProgressRecord>(value) {
                    Ok(record) => {
                        snapshot.records.insert(id, record);
                    }
                    Err(e) => {
                        warn!("Skipping corrupt progress record {}: {}", id, e);
                        report.skipped_records.push(id);
                    }
                }
            }
        }

        if let Some(serde_json::Value::Object(pending)) = root.remove("pending") {
            for (key, value) in pending {
                let id = PackId::new(key);
                match decode_pending(value) {
                    Some(items) => {
                        snapshot.pending.insert(id, items);
                    }
                    None => {
                        warn!("Skipping corrupt pending list {}", id);
                        report.skipped_pending.push(id);
                    }
                }
            }
        }

        Ok((snapshot, report))
    }
}

/// Pending lists must be arrays; non-string members are dropped.
fn decode_pending(value: serde_json::Value) -> Option<Vec<ItemId>> {
    let serde_json::Value::Array(values) = value else {
        return None;
    };
    Some(
        values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) if !s.is_empty() => Some(ItemId::new(s)),
                _ => None,
            })
            .collect(),
    )
}
