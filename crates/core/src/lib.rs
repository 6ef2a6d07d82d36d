//! packsync core data model.
//!
//! Packs, progress records, backend payloads and the inbound signal type,
//! plus the progress arithmetic every other crate builds on.

#![warn(missing_docs)]

mod id;
mod pack;
mod record;
mod signal;
mod status;
mod transfer;

pub mod math;

pub use id::{ItemId, PackId};
pub use pack::{Inventory, Pack, DEFAULT_ORDER};
pub use record::{PendingItems, ProgressRecord, UpdateSource};
pub use signal::Signal;
pub use status::{ActivationCounts, PackStatus, QueueState, SubscriptionActivity};
pub use transfer::{TransferState, WORKING};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
