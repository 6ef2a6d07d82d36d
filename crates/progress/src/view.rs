//! Read-only views for the presentation layer.

use packsync_core::{math, ItemId, PackId, ProgressRecord, TransferState};
use serde::Serialize;

use crate::matcher::match_transfers;
use crate::tracker::Tracker;

/// What a pack is doing, as shown on its button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackPhase {
    /// Items are transferring or activating
    Downloading,
    /// A cancel was requested and the backend has not caught up yet
    Cancelling,
    /// The backend is still activating the pack
    Activating,
    /// Waiting in the backend queue at this 1-based position
    Queued(usize),
    /// Fully active
    Enabled,
    /// Not active
    Disabled,
}

impl PackPhase {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PackPhase::Downloading => "downloading",
            PackPhase::Cancelling => "cancelling",
            PackPhase::Activating => "activating",
            PackPhase::Queued(_) => "queued",
            PackPhase::Enabled => "enabled",
            PackPhase::Disabled => "disabled",
        }
    }
}

/// Transfer detail of one in-flight item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadingItem {
    /// Item
    pub item_id: ItemId,
    /// File name, or the item id when the feed has none
    pub filename: String,
    /// Whole percent transferred
    pub percent: f64,
    /// Bytes received
    pub bytes_so_far: f64,
    /// Expected bytes, 0 when unknown
    pub bytes_total: f64,
    /// Bytes per second
    pub speed: f64,
}

impl DownloadingItem {
    fn from_transfer(item_id: &ItemId, state: &TransferState) -> Self {
        Self {
            item_id: item_id.clone(),
            filename: state
                .filename
                .clone()
                .unwrap_or_else(|| item_id.as_str().to_string()),
            percent: math::transfer_percent(state.bytes_so_far, state.bytes_total),
            bytes_so_far: state.bytes_so_far.max(0.0),
            bytes_total: state.bytes_total.max(0.0),
            speed: state.speed.max(0.0),
        }
    }
}

/// Everything the presentation layer shows for a pack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackOverview {
    /// Pack
    pub pack_id: PackId,
    /// Current phase
    pub phase: PackPhase,
    /// Progress record while tracked
    pub record: Option<ProgressRecord>,
    /// Downloading, but no transfer is moving bytes yet
    pub preparing: bool,
    /// The backend reported throttling
    pub rate_limited: bool,
    /// In-flight items of this pack
    pub downloading_items: Vec<DownloadingItem>,
}

impl Tracker {
    /// Phase of a pack, `None` if it is not in the inventory.
    pub fn phase(&self, pack_id: &PackId) -> Option<PackPhase> {
        let pack = self.inventory.get(pack_id)?;
        let current = self.queue.current_pack.as_deref() == Some(pack.name.as_str());
        let position = self.queue.position(&pack.name);

        let phase = if self.store.get(pack_id).is_some_and(|r| r.downloading) {
            PackPhase::Downloading
        } else if self.cancel_requested.as_ref() == Some(pack_id)
            || (self.cancel_all_requested && (current || position.is_some()))
        {
            PackPhase::Cancelling
        } else if self.activating.contains(pack_id) {
            PackPhase::Activating
        } else if let Some(position) = position {
            PackPhase::Queued(position)
        } else if self.is_enabled(pack_id) {
            PackPhase::Enabled
        } else {
            PackPhase::Disabled
        };
        Some(phase)
    }

    /// In-flight items of a pack according to the latest transfer feed.
    pub fn downloading_items(&self, pack_id: &PackId) -> Vec<DownloadingItem> {
        let Some(pack) = self.inventory.get(pack_id) else {
            return Vec::new();
        };
        let working: Vec<TransferState> = self
            .transfers
            .iter()
            .filter(|s| s.is_working())
            .cloned()
            .collect();
        match_transfers(&pack.items, &working)
            .into_iter()
            .map(|m| DownloadingItem::from_transfer(m.item, m.state))
            .collect()
    }

    /// Full view of a pack, `None` if it is not in the inventory.
    pub fn overview(&self, pack_id: &PackId) -> Option<PackOverview> {
        let phase = self.phase(pack_id)?;
        let record = self.store.get(pack_id).cloned();
        let downloading = record.as_ref().is_some_and(|r| r.downloading);
        Some(PackOverview {
            pack_id: pack_id.clone(),
            phase,
            preparing: downloading && !self.transfers.iter().any(TransferState::is_working),
            rate_limited: self.rate_limited,
            downloading_items: if downloading {
                self.downloading_items(pack_id)
            } else {
                Vec::new()
            },
            record,
        })
    }
}
