//! Busy-retry policy for lock contention on the shared database file.
//!
//! SQLite's own busy handler waits up to `busy_timeout` for the file lock.
//! When that still fails, the whole transaction is rolled back and re-run
//! after an exponentially growing, jittered pause. The number of re-runs is
//! capped so no caller ever waits without bound.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Default number of re-runs after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default pause before the first re-run.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Default upper bound on a single pause.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Retry ceiling and backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum re-runs after the first attempt (0 disables retrying).
    pub max_retries: u32,

    /// Pause before the first re-run.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Cap applied to every pause.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Growth factor between consecutive pauses.
    pub multiplier: f64,

    /// Fraction of each pause randomized in both directions, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered pause before re-run number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let micros = (self.initial_backoff.as_micros() as f64 * factor)
            .min(self.max_backoff.as_micros() as f64);
        Duration::from_micros(micros as u64)
    }

    /// Pause before re-run number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(1.0 + spread)
    }

    /// Upper bound on the total time spent sleeping between re-runs.
    pub fn worst_case_backoff(&self) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        (1..=self.max_retries)
            .map(|attempt| self.base_delay(attempt).mul_f64(1.0 + jitter))
            .sum()
    }

    /// Run `f` until it succeeds, fails with a non-contention error, or the
    /// retry ceiling is reached.
    ///
    /// `f` must be safe to re-run: each call starts a fresh transaction.
    pub(crate) fn run<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut retries = 0;
        loop {
            match f() {
                Ok(value) => {
                    if retries > 0 {
                        tracing::debug!(op, retries, "Succeeded after lock contention");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_lock_contention() => {
                    if retries >= self.max_retries {
                        tracing::warn!(
                            op,
                            attempts = retries + 1,
                            error = %e,
                            "Retry ceiling reached"
                        );
                        return Err(e.into_busy(retries + 1));
                    }
                    retries += 1;
                    let pause = self.delay(retries);
                    tracing::trace!(op, retry = retries, ?pause, "Database busy, backing off");
                    std::thread::sleep(pause);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate the schedule.
    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("jitter must be within [0, 1], got {}", self.jitter));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "initial_backoff ({:?}) exceeds max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            ));
        }
        Ok(())
    }
}
