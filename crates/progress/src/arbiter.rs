//! Update arbiter - the only writer of `ProgressRecord::progress`.
//!
//! Every ingestor hands its candidate value to [`Arbiter::submit`]. The
//! arbiter drops corrupt values, keeps the bar monotonic, smooths
//! implausible jumps, and settles disagreements between a byte-level feed
//! and a count-level one.

use packsync_core::{math, PackId, Time, UpdateSource};
use tracing::{debug, warn};

use crate::config::ArbiterConfig;
use crate::store::ProgressStore;

/// A proposed progress value.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Target pack
    pub pack_id: PackId,
    /// Proposed percentage
    pub progress: f64,
    /// Where it came from
    pub source: UpdateSource,
    /// Skip monotonicity, jump and priority checks
    pub force: bool,
}

impl Candidate {
    /// A regular, checked candidate.
    pub fn new(pack_id: PackId, progress: f64, source: UpdateSource) -> Self {
        Self {
            pack_id,
            progress,
            source,
            force: false,
        }
    }

    /// A forced candidate for confirmed transitions.
    pub fn forced(pack_id: PackId, progress: f64, source: UpdateSource) -> Self {
        Self {
            pack_id,
            progress,
            source,
            force: true,
        }
    }
}

/// Why a candidate was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No downloading record for the pack
    NoActiveRecord,
    /// NaN, infinite or negative
    InvalidValue,
    /// Would move the bar back by more than the tolerance
    Regression,
    /// A fresher transfer update owns the bar for now
    YieldedToTransfer,
    /// Forward move larger than one step, with smoothing switched off
    ImplausibleJump,
}

impl RejectReason {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoActiveRecord => "no_active_record",
            RejectReason::InvalidValue => "invalid_value",
            RejectReason::Regression => "regression",
            RejectReason::YieldedToTransfer => "yielded_to_transfer",
            RejectReason::ImplausibleJump => "implausible_jump",
        }
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Progress was written
    Committed {
        /// Value before
        previous: f64,
        /// Value written
        progress: f64,
        /// The candidate was larger than one step and got cut down
        smoothed: bool,
    },
    /// Accepted but nothing changed (small backward move or same value)
    Unchanged,
    /// Dropped
    Rejected(RejectReason),
}

impl Verdict {
    /// Whether progress was written.
    pub fn is_committed(&self) -> bool {
        matches!(self, Verdict::Committed { .. })
    }
}

/// Applies the write rules.
#[derive(Debug, Clone, Default)]
pub struct Arbiter {
    config: ArbiterConfig,
}

impl Arbiter {
    /// Create an arbiter.
    pub fn new(config: ArbiterConfig) -> Self {
        Self { config }
    }

    /// Active configuration.
    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    /// Check `candidate` against the pack's record and write it if allowed.
    ///
    /// On a commit the store's debounced persist is triggered.
    pub fn submit(&self, store: &mut ProgressStore, candidate: Candidate, now: Time) -> Verdict {
        let Candidate {
            pack_id,
            progress: proposed,
            source,
            force,
        } = candidate;

        let Some(record) = store.get_mut(&pack_id).filter(|r| r.downloading) else {
            debug!("Dropping {} update for {}: not downloading", source, pack_id);
            return Verdict::Rejected(RejectReason::NoActiveRecord);
        };

        if !proposed.is_finite() || proposed < 0.0 {
            warn!("Dropping invalid {} progress {} for {}", source, proposed, pack_id);
            return Verdict::Rejected(RejectReason::InvalidValue);
        }

        // 100 means every item is active; only a completion that the
        // counters agree with may claim it.
        let mut value = proposed;
        let terminal = source == UpdateSource::Completion && record.is_complete();
        if value >= 100.0 && !terminal {
            value = f64::from(math::weighted_progress(
                record.completed_mods,
                record.pending_mods.count(),
                record.total_mods,
            ))
            .min(f64::from(math::PRE_COMPLETION_CAP));
            debug!("Re-derived {} claim of 100 for {} as {}", source, pack_id, value);
        }

        let current = if record.progress.is_finite() { record.progress } else { 0.0 };
        let mut smoothed = false;

        if !force {
            if source.is_coarse()
                && record.last_update_source == UpdateSource::TransferEvents
                && now - record.last_update_time < self.config.transfer_grace()
            {
                debug!("{} update for {} yields to recent transfer progress", source, pack_id);
                return Verdict::Rejected(RejectReason::YieldedToTransfer);
            }

            if value < current - self.config.regression_tolerance {
                debug!(
                    "Rejecting {} regression for {}: {} -> {}",
                    source, pack_id, current, value
                );
                return Verdict::Rejected(RejectReason::Regression);
            }

            if value < current {
                return Verdict::Unchanged;
            }

            if value - current > self.config.max_jump {
                if !self.config.smooth_jumps {
                    debug!(
                        "Rejecting {} jump for {}: {} -> {}",
                        source, pack_id, current, value
                    );
                    return Verdict::Rejected(RejectReason::ImplausibleJump);
                }
                debug!(
                    "Smoothing {} jump for {}: {} -> {}",
                    source, pack_id, current, value
                );
                value = current + self.config.max_jump;
                smoothed = true;
            }
        }

        let value = value.clamp(0.0, 100.0);
        if value == current && record.last_update_source == source {
            record.last_update_time = now;
            return Verdict::Unchanged;
        }

        record.progress = value;
        record.last_update_source = source;
        record.last_update_time = now;
        store.debounced_persist(now);

        Verdict::Committed {
            previous: current,
            progress: value,
            smoothed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use packsync_core::{ItemId, ProgressRecord};

    fn setup(total: u32) -> (Arbiter, ProgressStore, PackId, Time) {
        let now = Utc::now();
        let mut store = ProgressStore::new(Duration::milliseconds(500));
        let id = PackId::from("pack");
        store.upsert(id.clone(), ProgressRecord::started(total, now - Duration::seconds(60)));
        (Arbiter::default(), store, id, now)
    }

    fn progress(store: &ProgressStore, id: &PackId) -> f64 {
        store.get(id).unwrap().progress
    }

    #[test]
    fn test_rejects_unknown_or_idle_pack() {
        let (arbiter, mut store, id, now) = setup(4);
        let verdict = arbiter.submit(
            &mut store,
            Candidate::new("other".into(), 10.0, UpdateSource::ItemDownloaded),
            now,
        );
        assert_eq!(verdict, Verdict::Rejected(RejectReason::NoActiveRecord));

        store.get_mut(&id).unwrap().downloading = false;
        let verdict = arbiter.submit(&mut store, Candidate::new(id, 10.0, UpdateSource::ItemDownloaded), now);
        assert_eq!(verdict, Verdict::Rejected(RejectReason::NoActiveRecord));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let (arbiter, mut store, id, now) = setup(4);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -1.0] {
            let verdict = arbiter.submit(
                &mut store,
                Candidate::forced(id.clone(), bad, UpdateSource::Completion),
                now,
            );
            assert_eq!(verdict, Verdict::Rejected(RejectReason::InvalidValue));
        }
        assert_eq!(progress(&store, &id), 0.0);
        assert!(!store.persist_pending());
    }

    #[test]
    fn test_commit_triggers_debounced_persist() {
        let (arbiter, mut store, id, now) = setup(4);
        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 20.0, UpdateSource::ItemDownloaded), now);
        assert_eq!(
            verdict,
            Verdict::Committed {
                previous: 0.0,
                progress: 20.0,
                smoothed: false
            }
        );
        let record = store.get(&id).unwrap();
        assert_eq!(record.last_update_source, UpdateSource::ItemDownloaded);
        assert_eq!(record.last_update_time, now);
        assert!(store.persist_pending());
    }

    #[test]
    fn test_regression_beyond_tolerance_rejected() {
        let (arbiter, mut store, id, now) = setup(4);
        arbiter.submit(&mut store, Candidate::new(id.clone(), 20.0, UpdateSource::ItemDownloaded), now);

        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 15.0, UpdateSource::ItemDownloaded), now);
        assert_eq!(verdict, Verdict::Rejected(RejectReason::Regression));

        // Within tolerance: accepted, but the bar does not move back.
        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 19.0, UpdateSource::ItemDownloaded), now);
        assert_eq!(verdict, Verdict::Unchanged);
        assert_eq!(progress(&store, &id), 20.0);
    }

    #[test]
    fn test_forced_update_may_move_backwards() {
        let (arbiter, mut store, id, now) = setup(4);
        arbiter.submit(&mut store, Candidate::new(id.clone(), 20.0, UpdateSource::ItemDownloaded), now);
        let verdict = arbiter.submit(&mut store, Candidate::forced(id.clone(), 5.0, UpdateSource::BackendSync), now);
        assert!(verdict.is_committed());
        assert_eq!(progress(&store, &id), 5.0);
    }

    #[test]
    fn test_large_jump_is_smoothed() {
        let (arbiter, mut store, id, now) = setup(4);
        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 80.0, UpdateSource::QueueCompletion), now);
        assert_eq!(
            verdict,
            Verdict::Committed {
                previous: 0.0,
                progress: 25.0,
                smoothed: true
            }
        );
        arbiter.submit(&mut store, Candidate::new(id.clone(), 80.0, UpdateSource::QueueCompletion), now);
        arbiter.submit(&mut store, Candidate::new(id.clone(), 80.0, UpdateSource::QueueCompletion), now);
        arbiter.submit(&mut store, Candidate::new(id.clone(), 80.0, UpdateSource::QueueCompletion), now);
        assert_eq!(progress(&store, &id), 80.0);
    }

    #[test]
    fn test_large_jump_rejected_without_smoothing() {
        let (_, mut store, id, now) = setup(4);
        let arbiter = Arbiter::new(ArbiterConfig {
            smooth_jumps: false,
            ..Default::default()
        });
        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 80.0, UpdateSource::QueueCompletion), now);
        assert_eq!(verdict, Verdict::Rejected(RejectReason::ImplausibleJump));
        assert_eq!(progress(&store, &id), 0.0);

        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 25.0, UpdateSource::QueueCompletion), now);
        assert!(verdict.is_committed());
        assert_eq!(progress(&store, &id), 25.0);
    }

    #[test]
    fn test_premature_100_is_rederived() {
        let (arbiter, mut store, id, now) = setup(4);
        {
            let record = store.get_mut(&id).unwrap();
            record.completed_mods = 1;
            for item in ["a", "b", "c"] {
                record.pending_mods.insert(ItemId::from(item));
            }
        }
        // Forced so the jump rule does not interfere.
        arbiter.submit(&mut store, Candidate::forced(id.clone(), 100.0, UpdateSource::AllDownloaded), now);
        assert_eq!(progress(&store, &id), 96.0);

        // Even the completion source cannot claim 100 while counters disagree.
        arbiter.submit(&mut store, Candidate::forced(id.clone(), 100.0, UpdateSource::Completion), now);
        assert_eq!(progress(&store, &id), 96.0);

        store.get_mut(&id).unwrap().completed_mods = 4;
        arbiter.submit(&mut store, Candidate::forced(id.clone(), 100.0, UpdateSource::Completion), now);
        assert_eq!(progress(&store, &id), 100.0);
    }

    #[test]
    fn test_coarse_source_yields_to_recent_transfer() {
        let (arbiter, mut store, id, now) = setup(4);
        arbiter.submit(&mut store, Candidate::new(id.clone(), 30.0, UpdateSource::TransferEvents), now);

        let soon = now + Duration::milliseconds(1_500);
        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 40.0, UpdateSource::StatusPush), soon);
        assert_eq!(verdict, Verdict::Rejected(RejectReason::YieldedToTransfer));

        // Past the grace window the newer source wins.
        let later = now + Duration::milliseconds(2_500);
        let verdict = arbiter.submit(&mut store, Candidate::new(id.clone(), 40.0, UpdateSource::StatusPush), later);
        assert!(verdict.is_committed());
        assert_eq!(store.get(&id).unwrap().last_update_source, UpdateSource::StatusPush);
    }

    #[test]
    fn test_fine_source_never_yields() {
        let (arbiter, mut store, id, now) = setup(4);
        arbiter.submit(&mut store, Candidate::new(id.clone(), 30.0, UpdateSource::StatusPush), now);
        let verdict = arbiter.submit(
            &mut store,
            Candidate::new(id.clone(), 35.0, UpdateSource::TransferEvents),
            now + Duration::milliseconds(10),
        );
        assert!(verdict.is_committed());
    }

    #[test]
    fn test_monotonic_under_any_order() {
        let candidates = [12.0, 40.0, 3.0, 39.0, 55.0, 54.5, 20.0, 61.0, 0.0, 99.0, 90.0];
        let (arbiter, mut store, id, now) = setup(100);
        let mut previous = progress(&store, &id);
        for (i, value) in candidates.iter().enumerate() {
            arbiter.submit(
                &mut store,
                Candidate::new(id.clone(), *value, UpdateSource::ItemDownloaded),
                now + Duration::milliseconds(i as i64),
            );
            let current = progress(&store, &id);
            assert!(current >= previous - 2.0, "{previous} -> {current}");
            assert!(current <= 100.0);
            previous = current;
        }
    }
}
