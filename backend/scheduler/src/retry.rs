//! Retry policy: exponential backoff with jitter for failed trigger runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration for re-arming a failed trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier for each subsequent wait.
    pub backoff_factor: f64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Add ±25% random jitter to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 30_000,
            backoff_factor: 2.0,
            max_delay_ms: 3_600_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(attempt as i32 - 1);
        let capped = raw.min(self.max_delay_ms as f64) as u64;

        let with_jitter = if self.jitter {
            let spread = (capped / 4) as i64;
            let offset = if spread > 0 {
                (rand_offset() % (spread as u64 * 2)) as i64 - spread
            } else {
                0
            };
            (capped as i64 + offset).max(0) as u64
        } else {
            capped
        };

        Duration::from_millis(with_jitter)
    }
}

/// xorshift64: enough randomness for jitter without a rand dependency.
fn rand_offset() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEED: AtomicU64 = AtomicU64::new(0x9e3779b97f4a7c15);
    let x = SEED.load(Ordering::Relaxed);
    let x = x ^ (x << 13);
    let x = x ^ (x >> 7);
    let x = x ^ (x << 17);
    SEED.store(x, Ordering::Relaxed);
    x
}
