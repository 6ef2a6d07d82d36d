//! Snapshot store trait abstraction.

use async_trait::async_trait;

use crate::snapshot::Snapshot;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot document is unusable as a whole
    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Where the progress snapshot lives between sessions.
///
/// Records and pending lists are always written and read together.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Load the stored snapshot, `None` when nothing was saved yet.
    ///
    /// Individual undecodable entries are skipped, see [`Snapshot::from_json_str`].
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// Delete the stored snapshot.
    async fn clear(&self) -> Result<()>;
}
