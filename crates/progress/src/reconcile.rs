//! Reconciliation against the backend's authoritative view.
//!
//! A subscription-activity report either proves every local download stale
//! (the backend is idle) or asks for fresh per-pack counts. Those counts go
//! through the same path as pushed activation counts, but only win when the
//! local state is old or clearly behind.

use packsync_core::{ActivationCounts, PackId, SubscriptionActivity, Time, UpdateSource};
use tracing::{debug, info};

use crate::ingest::apply_counts;
use crate::tracker::{Effect, Tracker};

impl Tracker {
    pub(crate) fn on_subscription_activity(&mut self, activity: SubscriptionActivity, now: Time) {
        self.rate_limited = activity.rate_limited;

        if activity.is_idle() {
            if !self.clear_stale(now).is_empty() {
                self.request(Effect::PersistNow);
            }
            return;
        }

        for pack_name in self.downloading_names() {
            self.request(Effect::FetchResyncCounts { pack_name });
        }
    }

    /// Drop every downloading record. Used when the backend reports that
    /// nothing is running, e.g. after the process died mid-transfer.
    pub fn clear_stale(&mut self, now: Time) -> Vec<PackId> {
        let stale = self.store.downloading_ids();
        for id in &stale {
            info!("Clearing stale download of {}", id);
            self.stop(id, now);
        }
        stale
    }

    /// Apply resync counts if the local record is stale or clearly behind.
    /// Returns whether they were applied.
    pub(crate) fn on_resync_counts(&mut self, pack_name: &str, counts: ActivationCounts, now: Time) -> bool {
        let Some(id) = self.inventory.find_by_name(pack_name).map(|p| p.id.clone()) else {
            return false;
        };
        let Some(record) = self.store.get(&id).filter(|r| r.downloading) else {
            return false;
        };

        let mut resynced = record.clone();
        apply_counts(&mut resynced, counts);
        let target = f64::from(resynced.derived_progress());
        let current = if record.progress.is_finite() { record.progress } else { 0.0 };

        let stale = now - record.last_update_time > self.config.resync_stale();
        let behind = target - current > self.config.resync_min_gain;
        if !stale && !behind {
            debug!(
                "Deferring resync of {} to fresher local state ({} vs {})",
                id, target, current
            );
            return false;
        }

        self.store.upsert(id.clone(), resynced);
        self.settle_counts(&id, UpdateSource::BackendSync, now);
        true
    }
}
