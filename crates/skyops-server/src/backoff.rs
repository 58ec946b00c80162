//! Exponential backoff with jitter for reconnects and retrying flushes.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, doubling per failure up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self
            .base
            .saturating_mul(1u32 << exp.min(16))
            .min(self.max);
        jittered(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Add up to 20% jitter so a fleet of loops doesn't retry in lockstep.
fn jittered(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    if delay_ms == 0 {
        return delay;
    }
    let span = delay_ms / 5;
    if span == 0 {
        return delay;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    delay + Duration::from_millis(nanos % (span + 1))
}
