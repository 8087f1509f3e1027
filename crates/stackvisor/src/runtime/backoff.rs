//! Restart delay policy

use std::time::Duration;

/// Capped doubling backoff between restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(crate::config::DEFAULT_BACKOFF_INITIAL_MS),
            max: Duration::from_millis(crate::config::DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before restart number `attempt + 1` (attempt counts from 0)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}
