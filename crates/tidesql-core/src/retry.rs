//! Exponential backoff for lock contention.
//!
//! Background work (batch advance, checkpoints) and foreground writes that
//! hit `SQLITE_BUSY`/`SQLITE_LOCKED` go through [`retry_busy`].
//!
//! | Attempt | Delay (base) | With ±25% jitter |
//! |---------|--------------|------------------|
//! | 0       | 10ms         | 8–13ms           |
//! | 1       | 20ms         | 15–25ms          |
//! | 2       | 40ms         | 30–50ms          |
//! | 3       | 80ms         | 60–100ms         |
//! | 4       | 160ms        | 120–200ms        |

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Backoff schedule for busy retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// `min(base_delay * 2^attempt, max_delay)` with ±25% jitter, at least 1ms.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = attempt.min(30) as i32;
        let raw = (base_ms * 2.0_f64.powi(exponent)).min(max_ms);
        let jittered = raw.mul_add(0.25 * jitter_factor(), raw).max(1.0);
        #[allow(clippy::cast_possible_truncation)]
        let ms = jittered as u64;
        Duration::from_millis(ms)
    }
}

/// Run `op`, sleeping and retrying while it fails with a retryable error.
pub fn retry_busy<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying busy operation");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Busy errors are retried; anything else is returned immediately.
pub fn is_busy(err: &Error) -> bool {
    err.is_retryable()
}

/// Jitter factor in `[-1.0, 1.0]` from a process-wide LCG.
fn jitter_factor() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    if SEED.load(Ordering::Relaxed) == 0 {
        let init = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(12345, |d| d.subsec_nanos().into())
            | 1;
        SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    let a: u64 = 6_364_136_223_846_793_005;
    let c: u64 = 1_442_695_040_888_963_407;
    let old = SEED.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
        Some(x.wrapping_mul(a).wrapping_add(c))
    });
    let val = old.unwrap_or(42);
    (val as f64 / u64::MAX as f64).mul_add(2.0, -1.0)
}
