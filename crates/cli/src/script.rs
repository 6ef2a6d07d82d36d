//! Replay scripts.
//!
//! A script describes an inventory, what the backend answers, and a timed
//! list of steps fed to the engine:
//!
//! ```json
//! {
//!   "inventory": [{ "id": "base", "name": "Base Pack", "items": ["a", "b"] }],
//!   "backend": { "activity": { "is_active": true, "active_count": 1 } },
//!   "steps": [
//!     { "after_ms": 0, "action": { "enable": "base" } },
//!     { "after_ms": 400, "action": { "signal": { "type": "item_transferred", "item": "a" } } }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use packsync_core::{
    ActivationCounts, Pack, PackStatus, QueueState, Signal, SubscriptionActivity,
};
use packsync_progress::{EngineHandle, InMemoryBackend};
use serde::Deserialize;

/// A whole replay.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    /// Packs known to the engine
    pub inventory: Vec<Pack>,
    /// Initial backend answers
    #[serde(default)]
    pub backend: BackendScript,
    /// Steps, in order
    #[serde(default)]
    pub steps: Vec<Step>,
    /// How long to keep the engine running after the last step
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_settle_ms() -> u64 {
    4_000
}

impl Script {
    /// Read a script from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse script {}", path.display()))
    }
}

/// Backend answers. Every field is optional so steps can change a subset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendScript {
    /// Subscription activity
    #[serde(default)]
    pub activity: Option<SubscriptionActivity>,
    /// Counts per pack name
    #[serde(default)]
    pub packs: BTreeMap<String, ActivationCounts>,
    /// Enable state per pack name
    #[serde(default)]
    pub statuses: BTreeMap<String, PackStatus>,
    /// Queue
    #[serde(default)]
    pub queue: Option<QueueState>,
    /// Fail every query
    #[serde(default)]
    pub unreachable: Option<bool>,
}

impl BackendScript {
    /// Apply these answers on top of what the backend already has.
    pub async fn apply(&self, backend: &InMemoryBackend) {
        if let Some(activity) = self.activity {
            backend.set_activity(activity).await;
        }
        for (name, counts) in &self.packs {
            backend.set_counts(name.clone(), *counts).await;
        }
        for (name, status) in &self.statuses {
            backend.set_status(name.clone(), *status).await;
        }
        if let Some(queue) = &self.queue {
            backend.set_queue(queue.clone()).await;
        }
        if let Some(unreachable) = self.unreachable {
            backend.set_unreachable(unreachable).await;
        }
    }
}

/// One timed step.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    /// Delay since the previous step
    #[serde(default)]
    pub after_ms: u64,
    /// What happens
    pub action: Action,
}

/// What a step does.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Push a backend signal
    Signal(Signal),
    /// Enable a pack by id
    Enable(String),
    /// Disable a pack by id
    Disable(String),
    /// Cancel a pack by id
    Cancel(String),
    /// Cancel everything
    CancelAll,
    /// Change backend answers
    Backend(BackendScript),
}

impl Action {
    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Signal(signal) => signal.kind(),
            Action::Enable(_) => "enable",
            Action::Disable(_) => "disable",
            Action::Cancel(_) => "cancel",
            Action::CancelAll => "cancel_all",
            Action::Backend(_) => "backend",
        }
    }

    /// Perform the step. Returns false once the engine is gone.
    pub async fn perform(self, handle: &EngineHandle, backend: &InMemoryBackend) -> bool {
        match self {
            Action::Signal(signal) => handle.send(signal),
            Action::Enable(id) => handle.enable_pack(id),
            Action::Disable(id) => handle.disable_pack(id),
            Action::Cancel(id) => handle.cancel_pack(id),
            Action::CancelAll => handle.cancel_all(),
            Action::Backend(answers) => {
                answers.apply(backend).await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packsync_progress::Backend;

    const SCRIPT: &str = r#"{
        "inventory": [{ "id": "base", "name": "Base Pack", "items": ["a", "b"] }],
        "backend": {
            "activity": { "is_active": true, "active_count": 1 },
            "packs": { "Base Pack": { "active": 0, "total": 2 } }
        },
        "steps": [
            { "action": { "enable": "base" } },
            { "after_ms": 400, "action": { "signal": { "type": "item_transferred", "item": "a" } } },
            { "after_ms": 100, "action": "cancel_all" },
            { "action": { "backend": { "unreachable": true } } }
        ]
    }"#;

    #[test]
    fn test_parse_script() {
        let script: Script = serde_json::from_str(SCRIPT).unwrap();
        assert_eq!(script.inventory.len(), 1);
        assert_eq!(script.inventory[0].item_total(), 2);
        assert_eq!(script.settle_ms, 4_000);

        let labels: Vec<_> = script.steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(labels, vec!["enable", "item_transferred", "cancel_all", "backend"]);
        assert_eq!(script.steps[0].after_ms, 0);
        assert_eq!(script.steps[1].after_ms, 400);
    }

    #[test]
    fn test_parse_script_rejects_unknown_action() {
        let json = r#"{ "inventory": [], "steps": [{ "action": { "explode": "base" } }] }"#;
        assert!(serde_json::from_str::<Script>(json).is_err());
    }

    #[tokio::test]
    async fn test_backend_answers_apply() {
        let script: Script = serde_json::from_str(SCRIPT).unwrap();
        let backend = InMemoryBackend::new();
        script.backend.apply(&backend).await;

        assert!(!backend.subscription_activity().await.unwrap().is_idle());
        assert_eq!(
            backend.pack_status("Base Pack").await.unwrap(),
            ActivationCounts { active: 0, total: 2 }
        );

        let Action::Backend(update) = script.steps[3].action.clone() else {
            panic!("expected backend step");
        };
        update.apply(&backend).await;
        assert!(backend.pack_status("Base Pack").await.is_err());
    }
}
