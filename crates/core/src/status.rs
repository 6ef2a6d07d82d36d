//! Status payloads answered by the backend.

use serde::{Deserialize, Serialize};

/// Confirmed-active and total item counts for one pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationCounts {
    /// Items confirmed active
    #[serde(default)]
    pub active: u32,
    /// Items in the pack according to the backend
    #[serde(default)]
    pub total: u32,
}

/// Whether the backend is subscribing to anything at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionActivity {
    /// Subscription work in progress
    #[serde(default)]
    pub is_active: bool,
    /// Items being processed
    #[serde(default)]
    pub active_count: u32,
    /// Items waiting in the queue
    #[serde(default)]
    pub queued_count: u32,
    /// Backend is throttling downloads
    #[serde(default)]
    pub rate_limited: bool,
}

impl SubscriptionActivity {
    /// Nothing running and nothing queued.
    pub fn is_idle(&self) -> bool {
        !self.is_active && self.active_count == 0 && self.queued_count == 0
    }
}

/// Enable state of one pack as seen by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackStatus {
    /// Every item of the pack is active
    #[serde(default)]
    pub fully_active: bool,
    /// Activation is still running
    #[serde(default)]
    pub pending: bool,
}

/// The backend's pack download queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    /// Pack names waiting, in order
    #[serde(default)]
    pub queue: Vec<String>,
    /// Pack name being downloaded
    #[serde(default)]
    pub current_pack: Option<String>,
    /// Items in the current pack
    #[serde(default)]
    pub mod_count: u32,
    /// Items of the current pack done
    #[serde(default)]
    pub mod_done: u32,
}

impl QueueState {
    /// 1-based position of `pack_name` in the queue.
    pub fn position(&self, pack_name: &str) -> Option<usize> {
        self.queue.iter().position(|n| n == pack_name).map(|i| i + 1)
    }
}
