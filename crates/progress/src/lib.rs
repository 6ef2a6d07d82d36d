//! Progress reconciliation.
//!
//! Turns noisy, overlapping backend signals into one monotonic percentage
//! per pack: the store and its persistence, the arbiter every write goes
//! through, the ingestors, periodic reconciliation, and the async engine.

#![warn(missing_docs)]

pub mod arbiter;
pub mod backend;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod matcher;
pub mod store;
pub mod tracker;
pub mod view;

mod ingest;
mod reconcile;

pub use arbiter::{Arbiter, Candidate, RejectReason, Verdict};
pub use backend::{Backend, BackendError, InMemoryBackend, IssuedCommand};
pub use config::{ArbiterConfig, ConfigError, EngineConfig};
pub use debounce::PersistDebouncer;
pub use engine::{Engine, EngineError, EngineHandle, MonotonicClock};
pub use matcher::{match_transfers, MatchTier, TransferMatch};
pub use store::{ProgressStore, RepairReport};
pub use tracker::{Effect, ProgressChanged, Tracker};
pub use view::{DownloadingItem, PackOverview, PackPhase};
