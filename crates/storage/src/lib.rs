//! Snapshot persistence for packsync.
//!
//! This crate provides a trait-based store for the progress snapshot with
//! a JSON file implementation and an in-memory one.

#![warn(missing_docs)]

pub mod trait_;
pub mod snapshot;
pub mod json_storage;
pub mod memory;

pub use trait_::{SnapshotStore, StorageError, Result};
pub use snapshot::{Snapshot, LoadReport, SNAPSHOT_VERSION};
pub use json_storage::JsonSnapshotStore;
pub use memory::MemorySnapshotStore;
