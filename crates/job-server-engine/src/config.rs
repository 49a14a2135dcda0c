use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between a failed attempt and the job becoming READY again
    pub retry_cooldown_ms: u64,
    /// Upper bound on concurrently running handlers; `None` means unbounded
    pub max_concurrency: Option<usize>,
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            retry_cooldown_ms: 100,
            max_concurrency: None,
            graceful_shutdown_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_millis(self.retry_cooldown_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}
