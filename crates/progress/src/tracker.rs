//! Synchronous reconciliation core.
//!
//! The tracker owns every piece of state the ingestors touch. It never
//! awaits: backend calls it wants made are queued as [`Effect`]s, and the
//! answers come back in as [`Signal`]s. Every method takes the current time
//! explicitly, so the whole core can be driven step by step.

use std::collections::{BTreeMap, BTreeSet};

use packsync_core::{
    Inventory, Pack, PackId, PackStatus, ProgressRecord, QueueState, Signal, Time, TransferState,
    UpdateSource,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::arbiter::{Arbiter, Candidate, Verdict};
use crate::config::EngineConfig;
use crate::store::ProgressStore;

/// A pack's record changed, or went away (`record: None`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressChanged {
    /// Pack
    pub pack_id: PackId,
    /// Record after the change
    pub record: Option<ProgressRecord>,
}

/// Work the tracker wants done outside itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Ask the backend to subscribe to a pack
    Subscribe {
        /// Backend pack name
        pack_name: String,
    },
    /// Ask the backend to deactivate a pack
    Deactivate {
        /// Backend pack name
        pack_name: String,
    },
    /// Stop transfers for one pack, or all of them
    CancelTransfer {
        /// Backend pack name, `None` for everything
        pack_name: Option<String>,
    },
    /// Fetch authoritative counts for a resync
    FetchResyncCounts {
        /// Backend pack name
        pack_name: String,
    },
    /// Write the snapshot without waiting for the debounce
    PersistNow,
}

/// Progress state for every pack plus the inputs needed to derive it.
#[derive(Debug)]
pub struct Tracker {
    pub(crate) config: EngineConfig,
    pub(crate) inventory: Inventory,
    pub(crate) store: ProgressStore,
    pub(crate) arbiter: Arbiter,
    /// Latest transfer feed
    pub(crate) transfers: Vec<TransferState>,
    /// Backend enable flags; packs missing here count as enabled
    pub(crate) enabled: BTreeMap<PackId, bool>,
    /// Packs whose activation is still running
    pub(crate) activating: BTreeSet<PackId>,
    pub(crate) queue: QueueState,
    pub(crate) rate_limited: bool,
    pub(crate) cancel_requested: Option<PackId>,
    pub(crate) cancel_all_requested: bool,
    /// Finished packs and when their record goes away
    pub(crate) removals: BTreeMap<PackId, Time>,
    changes: Vec<ProgressChanged>,
    effects: Vec<Effect>,
}

impl Tracker {
    /// Create an empty tracker.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            store: ProgressStore::new(config.persist_debounce()).with_max_wait(config.persist_max_wait()),
            arbiter: Arbiter::new(config.arbiter.clone()),
            config,
            inventory: Inventory::default(),
            transfers: Vec::new(),
            enabled: BTreeMap::new(),
            activating: BTreeSet::new(),
            queue: QueueState::default(),
            rate_limited: false,
            cancel_requested: None,
            cancel_all_requested: false,
            removals: BTreeMap::new(),
            changes: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Set the initial inventory.
    pub fn with_inventory(mut self, packs: impl IntoIterator<Item = Pack>, now: Time) -> Self {
        self.load_inventory(packs, now);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loaded packs.
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Record store.
    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Record store, for persistence.
    pub fn store_mut(&mut self) -> &mut ProgressStore {
        &mut self.store
    }

    /// Current record of a pack.
    pub fn progress(&self, pack_id: &PackId) -> Option<&ProgressRecord> {
        self.store.get(pack_id)
    }

    /// Backend enable flag of a pack.
    pub fn is_enabled(&self, pack_id: &PackId) -> bool {
        self.enabled.get(pack_id).copied().unwrap_or(true)
    }

    /// Last known queue.
    pub fn queue(&self) -> &QueueState {
        &self.queue
    }

    /// Whether anything is downloading, i.e. worth polling for.
    pub fn has_downloading(&self) -> bool {
        self.store.has_downloading()
    }

    /// Backend names of every downloading pack.
    pub fn downloading_names(&self) -> Vec<String> {
        self.store
            .downloading_ids()
            .iter()
            .filter_map(|id| self.inventory.get(id))
            .map(|pack| pack.name.clone())
            .collect()
    }

    /// Drain pending change notifications.
    pub fn take_changes(&mut self) -> Vec<ProgressChanged> {
        std::mem::take(&mut self.changes)
    }

    /// Drain pending effects.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Settle state just loaded from a snapshot: drop records of packs the
    /// inventory no longer has, then announce every remaining record.
    pub fn restored(&mut self, now: Time) {
        if !self.inventory.is_empty() {
            let orphans: Vec<PackId> = self
                .store
                .iter()
                .filter(|(id, _)| self.inventory.get(id).is_none())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &orphans {
                debug!("Dropping restored record of unknown pack {}", id);
                self.stop(id, now);
            }
        }
        let ids: Vec<PackId> = self.store.iter().map(|(id, _)| id.clone()).collect();
        for id in ids {
            self.notify(&id);
        }
    }

    /// Apply one inbound signal.
    pub fn handle(&mut self, signal: Signal, now: Time) {
        debug!("Handling {} signal", signal.kind());
        match signal {
            Signal::TransferStates { states } => self.on_transfer_states(states, now),
            Signal::ItemsCompleted { items } => self.on_items_completed(&items, now),
            Signal::ItemTransferred { item } => self.on_item_transferred(&item, now),
            Signal::ActivationCount { pack_name, counts } => {
                self.on_activation_count(&pack_name, counts, UpdateSource::StatusPush, now);
            }
            Signal::ResyncCounts { pack_name, counts } => {
                self.on_resync_counts(&pack_name, counts, now);
            }
            Signal::SubscriptionActivity { activity } => self.on_subscription_activity(activity, now),
            Signal::PackStatuses { statuses } => self.on_pack_statuses(statuses),
            Signal::QueueUpdate { queue } => self.on_queue_update(queue, now),
            Signal::InventoryLoaded { packs } => self.load_inventory(packs, now),
        }
    }

    /// Start tracking a pack. Returns `false` if it is unknown or already downloading.
    pub fn begin(&mut self, pack_id: &PackId, now: Time) -> bool {
        let Some(total) = self.inventory.get(pack_id).map(Pack::item_total) else {
            debug!("Cannot track unknown pack {}", pack_id);
            return false;
        };
        if self.store.get(pack_id).is_some_and(|r| r.downloading) {
            return false;
        }

        self.store.upsert(pack_id.clone(), ProgressRecord::started(total, now));
        self.removals.remove(pack_id);
        self.store.debounced_persist(now);
        info!("Tracking pack {} ({} items)", pack_id, total);
        self.notify(pack_id);
        true
    }

    /// User enabled a pack: subscribe to it, and track it unless another
    /// pack is downloading (then it waits in the backend's queue).
    pub fn enable(&mut self, pack_id: &PackId, now: Time) -> bool {
        let Some(name) = self.pack_name(pack_id) else {
            return false;
        };
        self.enabled.insert(pack_id.clone(), true);
        if !self.store.has_downloading() {
            self.begin(pack_id, now);
        }
        self.effects.push(Effect::Subscribe { pack_name: name });
        true
    }

    /// User disabled a pack: drop its record and deactivate it.
    pub fn disable(&mut self, pack_id: &PackId, now: Time) -> bool {
        let Some(name) = self.pack_name(pack_id) else {
            return false;
        };
        self.enabled.insert(pack_id.clone(), false);
        self.activating.remove(pack_id);
        self.stop(pack_id, now);
        self.effects.push(Effect::Deactivate { pack_name: name });
        true
    }

    /// Cancel one pack's download. Its record is dropped immediately.
    pub fn cancel(&mut self, pack_id: &PackId, now: Time) -> bool {
        let Some(name) = self.pack_name(pack_id) else {
            return false;
        };
        let queued = self.queue.position(&name).is_some()
            || self.queue.current_pack.as_deref() == Some(name.as_str());
        if self.store.get(pack_id).is_none() && !queued {
            return false;
        }

        info!("Cancelling pack {}", pack_id);
        self.cancel_requested = Some(pack_id.clone());
        self.stop(pack_id, now);
        self.effects.push(Effect::CancelTransfer {
            pack_name: Some(name),
        });
        true
    }

    /// Cancel everything. Issues a single cancel command.
    pub fn cancel_all(&mut self, now: Time) {
        info!("Cancelling all downloads");
        self.cancel_all_requested = true;
        for id in self.store.downloading_ids() {
            self.stop(&id, now);
        }
        self.effects.push(Effect::CancelTransfer { pack_name: None });
    }

    /// Drop records whose completion linger ran out. Returns the dropped ids.
    pub fn run_removals(&mut self, now: Time) -> Vec<PackId> {
        let due: Vec<PackId> = self
            .removals
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            debug!("Removing finished pack {}", id);
            self.stop(id, now);
        }
        due
    }

    /// Forget a pack's record. Returns whether there was one.
    pub(crate) fn stop(&mut self, pack_id: &PackId, now: Time) -> bool {
        self.removals.remove(pack_id);
        if self.store.remove(pack_id).is_none() {
            return false;
        }
        self.store.debounced_persist(now);
        self.notify(pack_id);
        true
    }

    /// Terminal transition: every item is active.
    ///
    /// Writes a forced 100, freezes the record and schedules its removal.
    pub(crate) fn complete(&mut self, pack_id: &PackId, now: Time) {
        let verdict = self.submit(
            Candidate::forced(pack_id.clone(), 100.0, UpdateSource::Completion),
            now,
        );
        if let Some(record) = self.store.get_mut(pack_id) {
            record.downloading = false;
            record.active_downloads = 0;
        }
        self.removals
            .insert(pack_id.clone(), now + self.config.completion_linger());
        self.enabled.insert(pack_id.clone(), true);
        self.activating.remove(pack_id);
        self.store.debounced_persist(now);
        info!("Pack {} complete ({:?})", pack_id, verdict);
    }

    /// Route a candidate through the arbiter.
    pub(crate) fn submit(&mut self, candidate: Candidate, now: Time) -> Verdict {
        let verdict = self.arbiter.submit(&mut self.store, candidate.clone(), now);
        if let Verdict::Rejected(reason) = &verdict {
            debug!(
                "{} candidate {} for {} rejected: {}",
                candidate.source,
                candidate.progress,
                candidate.pack_id,
                reason.as_str()
            );
        }
        verdict
    }

    pub(crate) fn notify(&mut self, pack_id: &PackId) {
        self.changes.push(ProgressChanged {
            pack_id: pack_id.clone(),
            record: self.store.get(pack_id).cloned(),
        });
    }

    pub(crate) fn request(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn pack_name(&self, pack_id: &PackId) -> Option<String> {
        let name = self.inventory.get(pack_id).map(|p| p.name.clone());
        if name.is_none() {
            debug!("Unknown pack {}", pack_id);
        }
        name
    }

    /// Replace the inventory. Records of packs that disappeared are dropped.
    pub fn load_inventory(&mut self, packs: impl IntoIterator<Item = Pack>, now: Time) {
        self.inventory = Inventory::new(packs);
        for pack in self.inventory.iter() {
            self.enabled.entry(pack.id.clone()).or_insert(true);
        }
        self.enabled.retain(|id, _| self.inventory.get(id).is_some());
        self.activating.retain(|id| self.inventory.get(id).is_some());

        let gone: Vec<PackId> = self
            .store
            .iter()
            .filter(|(id, _)| self.inventory.get(id).is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &gone {
            info!("Dropping record of removed pack {}", id);
            self.stop(id, now);
        }
        self.store.validate_and_repair();
        info!("Loaded {} packs", self.inventory.len());
    }

    fn on_pack_statuses(&mut self, statuses: BTreeMap<String, PackStatus>) {
        for (name, status) in statuses {
            let Some(id) = self.inventory.find_by_name(&name).map(|p| p.id.clone()) else {
                continue;
            };
            self.enabled.insert(id.clone(), status.fully_active);
            if status.pending {
                self.activating.insert(id);
            } else {
                self.activating.remove(&id);
            }
        }
    }

    fn on_queue_update(&mut self, queue: QueueState, now: Time) {
        let current = queue.current_pack.clone().filter(|name| !name.is_empty());
        if self.queue.current_pack != current || current.is_none() {
            self.cancel_requested = None;
        }
        if current.is_none() {
            self.cancel_all_requested = false;
        }
        self.queue = QueueState {
            current_pack: current.clone(),
            ..queue
        };

        let Some(name) = current else {
            return;
        };
        let Some(id) = self.inventory.find_by_name(&name).map(|p| p.id.clone()) else {
            return;
        };
        let cancelling = self.cancel_all_requested || self.cancel_requested.as_ref() == Some(&id);
        if self.store.get(&id).is_none() && !cancelling {
            debug!("Backend is downloading {}, tracking it", id);
            self.begin(&id, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn tracker() -> (Tracker, Time) {
        let now = Utc::now();
        let tracker = Tracker::new(EngineConfig::default()).with_inventory(
            vec![
                Pack::new("base", ["a", "b", "c", "d"]).with_name("Base Pack"),
                Pack::new("extra", ["e", "f"]).with_name("Extra Pack").with_order(2),
            ],
            now,
        );
        (tracker, now)
    }

    #[test]
    fn test_begin_creates_record() {
        let (mut tracker, now) = tracker();
        assert!(tracker.begin(&"base".into(), now));
        assert!(!tracker.begin(&"base".into(), now));
        assert!(!tracker.begin(&"missing".into(), now));

        let record = tracker.progress(&"base".into()).unwrap();
        assert_eq!(record.total_mods, 4);
        assert!(record.downloading);
        assert_eq!(tracker.take_changes().len(), 1);
    }

    #[test]
    fn test_enable_subscribes_and_tracks() {
        let (mut tracker, now) = tracker();
        assert!(tracker.enable(&"base".into(), now));
        assert!(tracker.progress(&"base".into()).is_some());

        // A second pack queues behind the first instead of being tracked.
        assert!(tracker.enable(&"extra".into(), now));
        assert!(tracker.progress(&"extra".into()).is_none());
        assert_eq!(
            tracker.take_effects(),
            vec![
                Effect::Subscribe {
                    pack_name: "Base Pack".into()
                },
                Effect::Subscribe {
                    pack_name: "Extra Pack".into()
                },
            ]
        );
    }

    #[test]
    fn test_disable_drops_record_and_deactivates() {
        let (mut tracker, now) = tracker();
        tracker.begin(&"base".into(), now);
        tracker.take_changes();

        assert!(tracker.disable(&"base".into(), now));
        assert!(tracker.progress(&"base".into()).is_none());
        assert!(!tracker.is_enabled(&"base".into()));
        assert_eq!(
            tracker.take_changes(),
            vec![ProgressChanged {
                pack_id: "base".into(),
                record: None
            }]
        );
        assert_eq!(
            tracker.take_effects(),
            vec![Effect::Deactivate {
                pack_name: "Base Pack".into()
            }]
        );
    }

    #[test]
    fn test_cancel_and_queue_clearing() {
        let (mut tracker, now) = tracker();
        let current = || Signal::QueueUpdate {
            queue: QueueState {
                current_pack: Some("Base Pack".into()),
                ..Default::default()
            },
        };
        tracker.handle(current(), now);
        assert!(tracker.progress(&"base".into()).is_some());

        assert!(tracker.cancel(&"base".into(), now));
        assert!(tracker.progress(&"base".into()).is_none());
        assert_eq!(tracker.cancel_requested, Some(PackId::from("base")));

        // The backend still reports the pack as current: it must not be re-tracked.
        tracker.handle(current(), now);
        assert!(tracker.progress(&"base".into()).is_none());
        assert!(tracker.cancel_requested.is_some());

        // Queue drained: the request is spent.
        tracker.handle(Signal::QueueUpdate { queue: QueueState::default() }, now);
        assert!(tracker.cancel_requested.is_none());

        assert!(!tracker.cancel(&"extra".into(), now));
    }

    #[test]
    fn test_cancel_all_issues_one_command() {
        let (mut tracker, now) = tracker();
        tracker.begin(&"base".into(), now);
        tracker.begin(&"extra".into(), now);
        tracker.take_effects();

        tracker.cancel_all(now);
        assert!(tracker.store().is_empty());
        assert_eq!(
            tracker.take_effects(),
            vec![Effect::CancelTransfer { pack_name: None }]
        );
    }

    #[test]
    fn test_queue_update_begins_tracking_current_pack() {
        let (mut tracker, now) = tracker();
        tracker.handle(
            Signal::QueueUpdate {
                queue: QueueState {
                    queue: vec!["Base Pack".into()],
                    current_pack: Some("Extra Pack".into()),
                    mod_count: 2,
                    mod_done: 0,
                },
            },
            now,
        );
        assert!(tracker.progress(&"extra".into()).is_some_and(|r| r.downloading));
        assert_eq!(tracker.queue().position("Base Pack"), Some(1));
    }

    #[test]
    fn test_pack_statuses_set_flags() {
        let (mut tracker, _) = tracker();
        let mut statuses = BTreeMap::new();
        statuses.insert(
            "Base Pack".to_string(),
            PackStatus {
                fully_active: false,
                pending: true,
            },
        );
        statuses.insert("Unknown".to_string(), PackStatus::default());
        tracker.handle(Signal::PackStatuses { statuses }, Utc::now());

        assert!(!tracker.is_enabled(&"base".into()));
        assert!(tracker.activating.contains(&PackId::from("base")));
        assert!(tracker.is_enabled(&"extra".into()));
    }

    #[test]
    fn test_inventory_reload_drops_missing_packs() {
        let (mut tracker, now) = tracker();
        tracker.begin(&"base".into(), now);
        tracker.begin(&"extra".into(), now);

        tracker.handle(
            Signal::InventoryLoaded {
                packs: vec![Pack::new("extra", ["e", "f"])],
            },
            now,
        );
        assert!(tracker.progress(&"base".into()).is_none());
        assert!(tracker.progress(&"extra".into()).is_some());
        assert!(!tracker.enabled.contains_key(&PackId::from("base")));
    }

    #[test]
    fn test_empty_pack_total_is_clamped() {
        let now = Utc::now();
        let mut tracker = Tracker::new(EngineConfig::default())
            .with_inventory(vec![Pack::new("empty", Vec::<String>::new())], now);
        tracker.begin(&"empty".into(), now);
        let record = tracker.progress(&"empty".into()).unwrap();
        assert_eq!(record.total_mods, 1);
        assert_eq!(record.derived_progress(), 0);
        assert_eq!(record.progress, 0.0);
    }

    #[test]
    fn test_restored_drops_unknown_packs() {
        let (mut tracker, now) = tracker();
        tracker.store_mut().upsert("base".into(), ProgressRecord::started(4, now));
        tracker.store_mut().upsert("ghost".into(), ProgressRecord::started(2, now));
        tracker.restored(now);

        assert!(tracker.progress(&"ghost".into()).is_none());
        let announced: Vec<_> = tracker
            .take_changes()
            .into_iter()
            .filter(|c| c.record.is_some())
            .map(|c| c.pack_id)
            .collect();
        assert_eq!(announced, vec![PackId::from("base")]);
    }

    #[test]
    fn test_removals_run_after_linger() {
        let (mut tracker, now) = tracker();
        tracker.begin(&"extra".into(), now);
        tracker.removals.insert("extra".into(), now + Duration::seconds(3));

        assert!(tracker.run_removals(now + Duration::seconds(2)).is_empty());
        assert_eq!(
            tracker.run_removals(now + Duration::seconds(3)),
            vec![PackId::from("extra")]
        );
        assert!(tracker.progress(&"extra".into()).is_none());
    }
}
