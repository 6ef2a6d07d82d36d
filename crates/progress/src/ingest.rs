//! Signal ingestors.
//!
//! Each ingestor turns one kind of event into counter updates plus a
//! candidate for the arbiter. All of them tolerate repeated delivery,
//! missing fields and arrival in any order: counters are only moved by
//! items not seen before, and the arbiter decides what the bar shows.

use packsync_core::{
    math, ActivationCounts, ItemId, PackId, ProgressRecord, Time, TransferState, UpdateSource,
};
use tracing::debug;

use crate::arbiter::Candidate;
use crate::matcher::match_transfers;
use crate::tracker::Tracker;

impl Tracker {
    /// Byte-level feed: adds in-flight transfer progress on top of the
    /// weighted item count.
    pub(crate) fn on_transfer_states(&mut self, states: Vec<TransferState>, now: Time) {
        self.transfers = states;
        let working: Vec<TransferState> = self
            .transfers
            .iter()
            .filter(|s| s.is_working())
            .cloned()
            .collect();

        for id in self.store.downloading_ids() {
            let Some(pack) = self.inventory.get(&id) else {
                continue;
            };
            let Some(record) = self.store.get(&id) else {
                continue;
            };

            let mut in_flight = 0u32;
            let mut percent_sum = 0.0;
            for matched in match_transfers(&pack.items, &working) {
                if record.activated.contains(matched.item) || record.pending_mods.contains(matched.item) {
                    continue;
                }
                in_flight += 1;
                percent_sum += math::transfer_percent(matched.state.bytes_so_far, matched.state.bytes_total);
            }
            let total = record.total_mods.max(1);
            let base = record.derived_progress();
            let complete = record.is_complete();

            let counters_moved = match self.store.get_mut(&id) {
                Some(record) if record.active_downloads != in_flight => {
                    record.active_downloads = in_flight;
                    true
                }
                _ => false,
            };
            if counters_moved {
                self.store.debounced_persist(now);
            }

            let mut committed = false;
            if in_flight > 0 {
                let bonus = math::safe_div(percent_sum, f64::from(total), 0.0).floor();
                let mut candidate = f64::from(base) + bonus;
                if !complete {
                    candidate = candidate.min(f64::from(math::PRE_COMPLETION_CAP));
                }
                committed = self
                    .submit(Candidate::new(id.clone(), candidate, UpdateSource::TransferEvents), now)
                    .is_committed();
            }
            if committed || counters_moved {
                self.notify(&id);
            }
        }
    }

    /// Queue "done" notices: each new item counts as active.
    pub(crate) fn on_items_completed(&mut self, items: &[ItemId], now: Time) {
        for item in items.iter().filter(|i| !i.is_empty()) {
            for id in self.tracked_packs_containing(item) {
                let Some(record) = self.store.get_mut(&id) else {
                    continue;
                };
                if !record.activated.insert(item.clone()) {
                    debug!("Item {} of {} already counted as active", item, id);
                    continue;
                }
                record.pending_mods.remove(item);
                // A count push may already have included this item.
                record.completed_mods = record.completed_mods.max(activated_count(record));
                record.active_downloads = record.active_downloads.saturating_sub(1);

                self.settle_counts(&id, UpdateSource::QueueCompletion, now);
            }
        }
    }

    /// An item finished transferring; it waits for activation.
    pub(crate) fn on_item_transferred(&mut self, item: &ItemId, now: Time) {
        if item.is_empty() {
            return;
        }
        for id in self.tracked_packs_containing(item) {
            let Some(record) = self.store.get_mut(&id) else {
                continue;
            };
            if record.activated.contains(item) || !record.pending_mods.insert(item.clone()) {
                continue;
            }
            record.active_downloads = record.active_downloads.saturating_sub(1);
            let derived = f64::from(record.derived_progress());
            let all_transferred = record.all_transferred() && !record.is_complete();
            self.store.debounced_persist(now);

            self.submit(Candidate::new(id.clone(), derived, UpdateSource::ItemDownloaded), now);
            if all_transferred {
                debug!("Every item of {} transferred, waiting for activation", id);
                self.submit(
                    Candidate::forced(id.clone(), f64::from(math::PRE_COMPLETION_CAP), UpdateSource::AllDownloaded),
                    now,
                );
            }
            self.notify(&id);
        }
    }

    /// Confirmed-active count pushed by the backend or answered to a poll.
    pub(crate) fn on_activation_count(
        &mut self,
        pack_name: &str,
        counts: ActivationCounts,
        source: UpdateSource,
        now: Time,
    ) {
        let Some(id) = self.inventory.find_by_name(pack_name).map(|p| p.id.clone()) else {
            debug!("Activation count for unknown pack {}", pack_name);
            return;
        };
        let Some(record) = self.store.get_mut(&id).filter(|r| r.downloading) else {
            return;
        };
        apply_counts(record, counts);
        self.settle_counts(&id, source, now);
    }

    /// Downloading packs that list `item`.
    fn tracked_packs_containing(&self, item: &ItemId) -> Vec<PackId> {
        self.inventory
            .packs_containing(item)
            .filter(|pack| self.store.get(&pack.id).is_some_and(|r| r.downloading))
            .map(|pack| pack.id.clone())
            .collect()
    }

    /// After counters moved: submit the weighted value and finish the pack
    /// if every item is active.
    pub(crate) fn settle_counts(&mut self, id: &PackId, source: UpdateSource, now: Time) {
        let Some(record) = self.store.get(id) else {
            return;
        };
        let derived = f64::from(record.derived_progress());
        let complete = record.is_complete();
        self.store.debounced_persist(now);

        self.submit(Candidate::new(id.clone(), derived, source), now);
        if complete {
            self.complete(id, now);
        }
        self.notify(id);
    }
}

/// Fold authoritative counts into a record.
///
/// Items that became active since the last count are taken from the front
/// of the pending list; activation order is assumed to follow transfer order.
/// The active count only moves forward and never drops below the items
/// already known to be active, so a stale count cannot undo completions.
pub(crate) fn apply_counts(record: &mut ProgressRecord, counts: ActivationCounts) {
    let graduated = counts.active.saturating_sub(record.completed_mods);
    for item in record.pending_mods.pop_oldest(graduated as usize) {
        record.activated.insert(item);
    }
    record.completed_mods = record
        .completed_mods
        .max(counts.active)
        .max(activated_count(record));
    if counts.total > 0 {
        record.total_mods = counts.total;
    }
}

fn activated_count(record: &ProgressRecord) -> u32 {
    u32::try_from(record.activated.len()).unwrap_or(u32::MAX)
}
