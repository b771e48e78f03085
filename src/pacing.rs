//! Pacing between backend dispatches
//!
//! The run controller asks the policy how long to wait before every dispatch
//! that follows an earlier one.
//! Tests use `NoPacing`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pacing policy consulted between batch dispatches.
pub trait PacingPolicy: Send + Sync {
    /// Delay before the next dispatch, given whether the last batch failed.
    fn delay(&self, last_failed: bool) -> Duration;
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPacing;

impl PacingPolicy for NoPacing {
    fn delay(&self, _last_failed: bool) -> Duration {
        Duration::ZERO
    }
}

/// Fixed delays, with a separate (usually longer) delay after a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedPacing {
    pub between_batches_ms: u64,
    pub after_failure_ms: u64,
}

impl PacingPolicy for FixedPacing {
    fn delay(&self, last_failed: bool) -> Duration {
        if last_failed {
            Duration::from_millis(self.after_failure_ms.max(self.between_batches_ms))
        } else {
            Duration::from_millis(self.between_batches_ms)
        }
    }
}
