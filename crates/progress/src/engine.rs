//! Async runner around the tracker.
//!
//! One task owns the [`Tracker`] and reacts to commands, backend answers and
//! four timers. Backend calls run as separate tasks bounded by the query
//! timeout; their answers come back to the loop as [`Signal`]s and take the
//! same path as pushed events. Nothing here blocks the loop, and no ingestor
//! ever runs concurrently with another.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use packsync_core::{PackId, ProgressRecord, Signal, Time};
use packsync_storage::{SnapshotStore, StorageError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError};
use crate::tracker::{Effect, ProgressChanged, Tracker};
use crate::view::PackOverview;

const CHANGE_CAPACITY: usize = 256;

/// Errors returned through an [`EngineHandle`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine loop has exited
    #[error("engine stopped")]
    Stopped,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Wall-clock time that never goes backwards.
///
/// Anchored to the system clock once, then advanced by tokio's monotonic
/// clock, so paused-time tests see consistent timestamps.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Time,
    started: Instant,
}

impl MonotonicClock {
    /// Anchor a clock at the current time.
    pub fn new() -> Self {
        Self {
            origin: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Current time.
    pub fn now(&self) -> Time {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Signal(Signal),
    Enable(PackId),
    Disable(PackId),
    Cancel(PackId),
    CancelAll,
    Progress(PackId, oneshot::Sender<Option<ProgressRecord>>),
    Overview(PackId, oneshot::Sender<Option<PackOverview>>),
    Persist(oneshot::Sender<Result<(), StorageError>>),
    Shutdown,
}

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    changes: broadcast::Sender<ProgressChanged>,
}

impl EngineHandle {
    /// Deliver a pushed signal. Returns `false` once the engine has stopped.
    pub fn send(&self, signal: Signal) -> bool {
        self.commands.send(Command::Signal(signal)).is_ok()
    }

    /// Current record of a pack.
    pub async fn progress(&self, pack_id: impl Into<PackId>) -> Option<ProgressRecord> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Progress(pack_id.into(), tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Full view of a pack.
    pub async fn overview(&self, pack_id: impl Into<PackId>) -> Option<PackOverview> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Overview(pack_id.into(), tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Enable a pack.
    pub fn enable_pack(&self, pack_id: impl Into<PackId>) -> bool {
        self.commands.send(Command::Enable(pack_id.into())).is_ok()
    }

    /// Disable a pack.
    pub fn disable_pack(&self, pack_id: impl Into<PackId>) -> bool {
        self.commands.send(Command::Disable(pack_id.into())).is_ok()
    }

    /// Cancel a pack's download.
    pub fn cancel_pack(&self, pack_id: impl Into<PackId>) -> bool {
        self.commands.send(Command::Cancel(pack_id.into())).is_ok()
    }

    /// Cancel every download.
    pub fn cancel_all(&self) -> bool {
        self.commands.send(Command::CancelAll).is_ok()
    }

    /// Write the snapshot now.
    pub async fn persist(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Persist(tx))
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)??;
        Ok(())
    }

    /// Receive every change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressChanged> {
        self.changes.subscribe()
    }

    /// Stop the engine after the commands already sent.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The progress engine.
pub struct Engine {
    tracker: Tracker,
    backend: Arc<dyn Backend>,
    snapshots: Arc<dyn SnapshotStore>,
    clock: MonotonicClock,
    commands: mpsc::UnboundedReceiver<Command>,
    changes: broadcast::Sender<ProgressChanged>,
    calls: JoinSet<Option<Signal>>,
}

impl Engine {
    /// Create an engine and its handle.
    pub fn new(
        tracker: Tracker,
        backend: Arc<dyn Backend>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> (Self, EngineHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let handle = EngineHandle {
            commands: commands_tx,
            changes: changes.clone(),
        };
        let engine = Self {
            tracker,
            backend,
            snapshots,
            clock: MonotonicClock::new(),
            commands: commands_rx,
            changes,
            calls: JoinSet::new(),
        };
        (engine, handle)
    }

    /// Restore the snapshot, then run until shutdown or until every handle
    /// is dropped. Ends with a final persist.
    pub async fn run(mut self) {
        self.restore().await;

        let config = self.tracker.config().clone();
        let mut fast_poll = tokio::time::interval(config.fast_poll());
        let mut flag_sync = tokio::time::interval(config.flag_sync());
        let mut resync = tokio::time::interval(config.resync());
        let mut housekeeping = tokio::time::interval(config.housekeeping());
        for timer in [&mut fast_poll, &mut flag_sync, &mut resync, &mut housekeeping] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        info!("Progress engine started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.apply(command).await,
                },
                Some(joined) = self.calls.join_next(), if !self.calls.is_empty() => {
                    match joined {
                        Ok(Some(signal)) => {
                            let now = self.clock.now();
                            self.tracker.handle(signal, now);
                        }
                        Ok(None) => {}
                        Err(e) => debug!("Backend call ended early: {}", e),
                    }
                }
                _ = fast_poll.tick() => self.poll_pack_status(),
                _ = flag_sync.tick() => self.sync_flags(),
                _ = resync.tick() => self.resync(),
                _ = housekeeping.tick() => self.housekeeping().await,
            }
            self.drain().await;
        }

        self.calls.abort_all();
        while self.calls.join_next().await.is_some() {}
        if let Err(e) = self.persist().await {
            error!("Final persist failed: {}", e);
        }
        info!("Progress engine stopped");
    }

    async fn restore(&mut self) {
        match self.tracker.store_mut().restore(self.snapshots.as_ref()).await {
            Ok(report) if !report.is_clean() => {
                warn!("Restored snapshot needed repair for {} packs", report.repaired.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Could not restore progress snapshot, starting empty: {}", e),
        }
        let now = self.clock.now();
        self.tracker.restored(now);
        self.drain().await;
    }

    async fn apply(&mut self, command: Command) {
        let now = self.clock.now();
        match command {
            Command::Signal(signal) => self.tracker.handle(signal, now),
            Command::Enable(pack_id) => {
                self.tracker.enable(&pack_id, now);
            }
            Command::Disable(pack_id) => {
                self.tracker.disable(&pack_id, now);
            }
            Command::Cancel(pack_id) => {
                self.tracker.cancel(&pack_id, now);
            }
            Command::CancelAll => self.tracker.cancel_all(now),
            Command::Progress(pack_id, reply) => {
                let _ = reply.send(self.tracker.progress(&pack_id).cloned());
            }
            Command::Overview(pack_id, reply) => {
                let _ = reply.send(self.tracker.overview(&pack_id));
            }
            Command::Persist(reply) => {
                let _ = reply.send(self.persist().await);
            }
            Command::Shutdown => {}
        }
    }

    /// Push changes to subscribers and carry out requested effects.
    async fn drain(&mut self) {
        for change in self.tracker.take_changes() {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }

        for effect in self.tracker.take_effects() {
            let backend = self.backend.clone();
            match effect {
                Effect::PersistNow => {
                    if let Err(e) = self.persist().await {
                        error!("Persist failed: {}", e);
                    }
                }
                Effect::FetchResyncCounts { pack_name } => self.spawn_call("resync counts", async move {
                    let counts = backend.pack_status(&pack_name).await;
                    counts.map(|counts| Some(Signal::ResyncCounts { pack_name, counts }))
                }),
                Effect::Subscribe { pack_name } => self.spawn_call("subscribe", async move {
                    backend.subscribe_to_pack(&pack_name).await.map(|()| None::<Signal>)
                }),
                Effect::Deactivate { pack_name } => self.spawn_call("deactivate", async move {
                    backend.deactivate_pack(&pack_name).await.map(|()| None::<Signal>)
                }),
                Effect::CancelTransfer { pack_name } => self.spawn_call("cancel", async move {
                    backend
                        .cancel_transfer(pack_name.as_deref())
                        .await
                        .map(|()| None::<Signal>)
                }),
            }
        }
    }

    /// Fast timer: per-pack status, only while something downloads.
    fn poll_pack_status(&mut self) {
        if !self.tracker.has_downloading() {
            return;
        }
        for pack_name in self.tracker.downloading_names() {
            let backend = self.backend.clone();
            self.spawn_call("pack status", async move {
                let counts = backend.pack_status(&pack_name).await;
                counts.map(|counts| Some(Signal::ActivationCount { pack_name, counts }))
            });
        }
    }

    /// Slow timer: enable flags and queue.
    fn sync_flags(&mut self) {
        let backend = self.backend.clone();
        self.spawn_call("pack statuses", async move {
            backend
                .pack_statuses()
                .await
                .map(|statuses| Some(Signal::PackStatuses { statuses }))
        });
        let backend = self.backend.clone();
        self.spawn_call("queue", async move {
            backend
                .queue_state()
                .await
                .map(|queue| Some(Signal::QueueUpdate { queue }))
        });
    }

    /// Resync timer: authoritative subscription activity.
    fn resync(&mut self) {
        let backend = self.backend.clone();
        self.spawn_call("subscription activity", async move {
            backend
                .subscription_activity()
                .await
                .map(|activity| Some(Signal::SubscriptionActivity { activity }))
        });
    }

    async fn housekeeping(&mut self) {
        let now = self.clock.now();
        self.tracker.run_removals(now);
        if let Err(e) = self
            .tracker
            .store_mut()
            .flush_if_due(now, self.snapshots.as_ref())
            .await
        {
            warn!("Persist failed, retrying next tick: {}", e);
        }
    }

    async fn persist(&mut self) -> Result<(), StorageError> {
        self.tracker.store_mut().persist(self.snapshots.as_ref()).await
    }

    /// Run a backend call off the loop. Failures and timeouts only skip
    /// this round.
    fn spawn_call<F>(&mut self, label: &'static str, call: F)
    where
        F: Future<Output = Result<Option<Signal>, BackendError>> + Send + 'static,
    {
        let limit = self.tracker.config().query_timeout();
        self.calls.spawn(async move {
            match tokio::time::timeout(limit, call).await {
                Ok(Ok(signal)) => signal,
                Ok(Err(e)) => {
                    debug!("Backend {} failed: {}", label, e);
                    None
                }
                Err(_) => {
                    debug!("Backend {} failed: {}", label, BackendError::Timeout);
                    None
                }
            }
        });
    }
}
