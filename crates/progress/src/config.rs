//! Engine configuration.
//!
//! The thresholds here are tuned for a smooth looking bar, not derived from
//! anything; every one of them can be overridden from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rules the arbiter applies to non-forced candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Backward moves larger than this are rejected
    pub regression_tolerance: f64,

    /// Forward moves larger than this are smoothed to this step
    pub max_jump: f64,

    /// Commit one `max_jump` step for an oversized move instead of dropping it
    pub smooth_jumps: bool,

    /// How long a byte-level update keeps priority over count-level ones
    pub transfer_grace_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            regression_tolerance: 2.0,
            max_jump: 25.0,
            smooth_jumps: true,
            transfer_grace_ms: 2_000,
        }
    }
}

impl ArbiterConfig {
    /// Priority window of transfer updates.
    pub fn transfer_grace(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(ms_i64(self.transfer_grace_ms))
    }
}

/// Configuration for the progress engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Arbiter thresholds
    pub arbiter: ArbiterConfig,

    /// A resync applies when the last local update is older than this
    pub resync_stale_ms: u64,

    /// ...or when it would raise progress by more than this
    pub resync_min_gain: f64,

    /// Quiet period before a burst of updates is written out
    pub persist_debounce_ms: u64,

    /// Longest a continuous stream of updates may hold back a write
    pub persist_max_wait_ms: u64,

    /// How long a finished pack stays visible at 100%
    pub completion_linger_ms: u64,

    /// Per-pack status poll while something is downloading
    pub fast_poll_ms: u64,

    /// Enable/disable flag re-sync
    pub flag_sync_ms: u64,

    /// Authoritative subscription-activity resync
    pub resync_ms: u64,

    /// Deadline check cadence
    pub housekeeping_ms: u64,

    /// Backend queries not answered within this are skipped
    pub query_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arbiter: ArbiterConfig::default(),
            resync_stale_ms: 5_000,
            resync_min_gain: 5.0,
            persist_debounce_ms: 500,
            persist_max_wait_ms: 2_000,
            completion_linger_ms: 3_000,
            fast_poll_ms: 1_000,
            flag_sync_ms: 10_000,
            resync_ms: 5_000,
            housekeeping_ms: 100,
            query_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Load a (possibly partial) configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Resync staleness threshold.
    pub fn resync_stale(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(ms_i64(self.resync_stale_ms))
    }

    /// Debounce quiet period.
    pub fn persist_debounce(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(ms_i64(self.persist_debounce_ms))
    }

    /// Burst limit for debounced writes.
    pub fn persist_max_wait(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(ms_i64(self.persist_max_wait_ms))
    }

    /// Linger time after completion.
    pub fn completion_linger(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(ms_i64(self.completion_linger_ms))
    }

    /// Fast poll period.
    pub fn fast_poll(&self) -> Duration {
        period(self.fast_poll_ms)
    }

    /// Flag sync period.
    pub fn flag_sync(&self) -> Duration {
        period(self.flag_sync_ms)
    }

    /// Resync period.
    pub fn resync(&self) -> Duration {
        period(self.resync_ms)
    }

    /// Housekeeping period.
    pub fn housekeeping(&self) -> Duration {
        period(self.housekeeping_ms)
    }

    /// Backend query timeout.
    pub fn query_timeout(&self) -> Duration {
        period(self.query_timeout_ms)
    }
}

// chrono::Duration panics past i64::MAX / 1000 milliseconds
fn ms_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX).min(i64::MAX / 1_000_000)
}

// tokio intervals panic on a zero period
fn period(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"fast_poll_ms": 250, "arbiter": {"max_jump": 10}}"#).unwrap();
        assert_eq!(config.fast_poll_ms, 250);
        assert_eq!(config.arbiter.max_jump, 10.0);
        assert_eq!(config.arbiter.regression_tolerance, 2.0);
        assert_eq!(config.persist_debounce_ms, 500);
    }

    #[test]
    fn test_zero_periods_are_bumped() {
        let config = EngineConfig {
            housekeeping_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.housekeeping(), Duration::from_millis(1));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"completion_linger_ms": 1000}"#).unwrap();
        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.completion_linger(), chrono::Duration::seconds(1));
        assert!(EngineConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
