//! Exponential reconnect backoff: 1s, 2s, 4s, ... capped at 60s.

use std::time::Duration;

pub const BASE_DELAY_SECS: u64 = 1;
pub const MAX_DELAY_SECS: u64 = 60;

/// Delay before attempt `k` (zero-based): `min(2^k, 60)` seconds.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .saturating_mul(BASE_DELAY_SECS)
        .clamp(BASE_DELAY_SECS, MAX_DELAY_SECS);
    Duration::from_secs(secs)
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the base delay. Called once a connection proves healthy.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
