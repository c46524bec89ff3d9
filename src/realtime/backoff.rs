// realtime/backoff.rs
use std::time::Duration;

use super::TransportConfig;

/// `min(base * 2^attempt, cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Counts reconnect attempts for one client. Reset only on a clean connect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            base: config.base_delay,
            cap: config.cap_delay,
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(backoff_delay(self.base, self.cap, self.attempt))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
