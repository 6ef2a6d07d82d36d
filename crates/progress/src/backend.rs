//! Backend port.
//!
//! The backend owns inventory, subscriptions and file transfers. The engine
//! only asks it questions and sends it fire-and-forget commands; answers are
//! turned into signals by the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use packsync_core::{ActivationCounts, PackStatus, QueueState, SubscriptionActivity};
use tokio::sync::Mutex;

/// Backend errors. None of them are fatal: the query is retried next tick.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Backend not reachable
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// No answer in time
    #[error("backend query timed out")]
    Timeout,

    /// Backend refused the request
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Queries and commands the engine issues.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Confirmed-active and total counts of a pack.
    async fn pack_status(&self, pack_name: &str) -> Result<ActivationCounts, BackendError>;

    /// Global subscription activity.
    async fn subscription_activity(&self) -> Result<SubscriptionActivity, BackendError>;

    /// Enable state of every pack, by pack name.
    async fn pack_statuses(&self) -> Result<BTreeMap<String, PackStatus>, BackendError>;

    /// Current pack queue.
    async fn queue_state(&self) -> Result<QueueState, BackendError>;

    /// Start subscribing to a pack.
    async fn subscribe_to_pack(&self, pack_name: &str) -> Result<(), BackendError>;

    /// Deactivate a pack.
    async fn deactivate_pack(&self, pack_name: &str) -> Result<(), BackendError>;

    /// Stop transfers of one pack, or of everything.
    async fn cancel_transfer(&self, pack_name: Option<&str>) -> Result<(), BackendError>;
}

/// A command received by [`InMemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuedCommand {
    /// `subscribe_to_pack`
    Subscribe(String),
    /// `deactivate_pack`
    Deactivate(String),
    /// `cancel_transfer`
    CancelTransfer(Option<String>),
}

#[derive(Debug, Default)]
struct BackendState {
    activity: SubscriptionActivity,
    counts: BTreeMap<String, ActivationCounts>,
    statuses: BTreeMap<String, PackStatus>,
    queue: QueueState,
    unreachable: bool,
    issued: Vec<IssuedCommand>,
    queries: usize,
}

/// Scriptable backend for tests and replays.
///
/// Answers come from whatever was last set; commands are only recorded.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

impl InMemoryBackend {
    /// Create an idle backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the subscription activity.
    pub async fn set_activity(&self, activity: SubscriptionActivity) {
        self.state.lock().await.activity = activity;
    }

    /// Set the counts answered for a pack.
    pub async fn set_counts(&self, pack_name: impl Into<String>, counts: ActivationCounts) {
        self.state.lock().await.counts.insert(pack_name.into(), counts);
    }

    /// Set a pack's enable state.
    pub async fn set_status(&self, pack_name: impl Into<String>, status: PackStatus) {
        self.state.lock().await.statuses.insert(pack_name.into(), status);
    }

    /// Set the queue.
    pub async fn set_queue(&self, queue: QueueState) {
        self.state.lock().await.queue = queue;
    }

    /// Make every query fail.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Commands received so far.
    pub async fn issued(&self) -> Vec<IssuedCommand> {
        self.state.lock().await.issued.clone()
    }

    /// Number of queries answered or refused so far.
    pub async fn query_count(&self) -> usize {
        self.state.lock().await.queries
    }

    async fn query<T>(&self, answer: impl FnOnce(&BackendState) -> Result<T, BackendError>) -> Result<T, BackendError> {
        let mut state = self.state.lock().await;
        state.queries += 1;
        if state.unreachable {
            return Err(BackendError::Unreachable("in-memory backend switched off".to_string()));
        }
        answer(&*state)
    }

    async fn record(&self, command: IssuedCommand) -> Result<(), BackendError> {
        self.state.lock().await.issued.push(command);
        Ok(())
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn pack_status(&self, pack_name: &str) -> Result<ActivationCounts, BackendError> {
        self.query(|state| {
            state
                .counts
                .get(pack_name)
                .copied()
                .ok_or_else(|| BackendError::Rejected(format!("unknown pack {}", pack_name)))
        })
        .await
    }

    async fn subscription_activity(&self) -> Result<SubscriptionActivity, BackendError> {
        self.query(|state| Ok(state.activity)).await
    }

    async fn pack_statuses(&self) -> Result<BTreeMap<String, PackStatus>, BackendError> {
        self.query(|state| Ok(state.statuses.clone())).await
    }

    async fn queue_state(&self) -> Result<QueueState, BackendError> {
        self.query(|state| Ok(state.queue.clone())).await
    }

    async fn subscribe_to_pack(&self, pack_name: &str) -> Result<(), BackendError> {
        self.record(IssuedCommand::Subscribe(pack_name.to_string())).await
    }

    async fn deactivate_pack(&self, pack_name: &str) -> Result<(), BackendError> {
        self.record(IssuedCommand::Deactivate(pack_name.to_string())).await
    }

    async fn cancel_transfer(&self, pack_name: Option<&str>) -> Result<(), BackendError> {
        self.record(IssuedCommand::CancelTransfer(pack_name.map(str::to_string)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_answers_and_records() {
        let backend = InMemoryBackend::new();
        backend
            .set_counts("Base", ActivationCounts { active: 1, total: 3 })
            .await;
        assert_eq!(
            backend.pack_status("Base").await.unwrap(),
            ActivationCounts { active: 1, total: 3 }
        );
        assert!(matches!(
            backend.pack_status("Other").await,
            Err(BackendError::Rejected(_))
        ));
        assert!(backend.subscription_activity().await.unwrap().is_idle());

        backend.subscribe_to_pack("Base").await.unwrap();
        backend.cancel_transfer(None).await.unwrap();
        assert_eq!(
            backend.issued().await,
            vec![
                IssuedCommand::Subscribe("Base".into()),
                IssuedCommand::CancelTransfer(None)
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_queries() {
        let backend = InMemoryBackend::new();
        backend.set_unreachable(true).await;
        assert!(matches!(
            backend.subscription_activity().await,
            Err(BackendError::Unreachable(_))
        ));
        assert_eq!(backend.query_count().await, 1);
    }
}
