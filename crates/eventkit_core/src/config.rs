//! Engine tuning knobs.
//!
//! # Responsibility
//! - Hold limits the propagation engine enforces.
//! - Deserialize from a host application's config with defaults for
//!   omitted keys.

use serde::Deserialize;
use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_OCCURRENCES: u16 = 1_000;

/// Propagation engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bounded wait for a series lock before `LockTimeout`.
    pub lock_timeout_ms: u64,
    /// Largest series an UNTIL rule may materialize. COUNT rules are not
    /// limited by it.
    pub max_occurrences: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            max_occurrences: DEFAULT_MAX_OCCURRENCES,
        }
    }
}

impl EngineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
