//! Inbound signals - every event the tracker reacts to.
//!
//! Pushed events and answers to our own polls share this type, so an
//! authoritative answer takes the same path whichever way it arrived.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::ItemId;
use crate::pack::Pack;
use crate::status::{ActivationCounts, PackStatus, QueueState, SubscriptionActivity};
use crate::transfer::TransferState;

/// An event delivered to the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Snapshot of every in-flight transfer
    TransferStates {
        /// Current feed
        states: Vec<TransferState>,
    },

    /// Items finished and confirmed by the download queue
    ItemsCompleted {
        /// Finished items
        items: Vec<ItemId>,
    },

    /// One item finished transferring, activation still pending
    ItemTransferred {
        /// The item
        item: ItemId,
    },

    /// Confirmed-active count for a pack, pushed or answered to a poll
    ActivationCount {
        /// Backend pack name
        pack_name: String,
        /// Counts
        counts: ActivationCounts,
    },

    /// Per-pack counts fetched by the periodic resync
    ResyncCounts {
        /// Backend pack name
        pack_name: String,
        /// Counts
        counts: ActivationCounts,
    },

    /// Global subscription activity
    SubscriptionActivity {
        /// Activity report
        activity: SubscriptionActivity,
    },

    /// Enable flags for every pack, keyed by backend pack name
    PackStatuses {
        /// Status per pack name
        statuses: BTreeMap<String, PackStatus>,
    },

    /// Pack download queue changed
    QueueUpdate {
        /// New queue
        queue: QueueState,
    },

    /// Pack inventory (re)loaded
    InventoryLoaded {
        /// All packs
        packs: Vec<Pack>,
    },
}

impl Signal {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::TransferStates { .. } => "transfer_states",
            Signal::ItemsCompleted { .. } => "items_completed",
            Signal::ItemTransferred { .. } => "item_transferred",
            Signal::ActivationCount { .. } => "activation_count",
            Signal::ResyncCounts { .. } => "resync_counts",
            Signal::SubscriptionActivity { .. } => "subscription_activity",
            Signal::PackStatuses { .. } => "pack_statuses",
            Signal::QueueUpdate { .. } => "queue_update",
            Signal::InventoryLoaded { .. } => "inventory_loaded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_activation_count() {
        let json = r#"{"type": "activation_count", "pack_name": "Base", "counts": {"active": 2, "total": 5}}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(
            signal,
            Signal::ActivationCount {
                pack_name: "Base".into(),
                counts: ActivationCounts { active: 2, total: 5 },
            }
        );
        assert_eq!(signal.kind(), "activation_count");
    }

    #[test]
    fn test_tagged_item_transferred() {
        let json = r#"{"type": "item_transferred", "item": "abc"}"#;
        let signal: Signal = serde_json::from_str(json).unwrap();
        assert_eq!(signal, Signal::ItemTransferred { item: "abc".into() });
    }

    #[test]
    fn test_transfer_feed_survives_null_counters() {
        let json = r#"{"type": "transfer_states", "states": [
            {"id": "abc", "dlnow": null, "dltotal": 100, "state": "working"},
            {"filename": "def.zip", "dlnow": 10, "dltotal": 20, "state": "working"}
        ]}"#;
        let Signal::TransferStates { states } = serde_json::from_str(json).unwrap() else {
            panic!("expected transfer states");
        };
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].bytes_so_far, 0.0);
        assert_eq!(states[1].bytes_so_far, 10.0);
    }
}
