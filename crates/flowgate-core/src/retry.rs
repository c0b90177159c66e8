//! Retry policy attached to every action

use crate::error::{CoreError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether an action may be retried, how often, and the randomized backoff range
///
/// `max_retries` counts re-attempts after the first failure, so an enabled
/// policy runs an action at most `max_retries + 1` times. The delay before
/// each re-attempt is drawn uniformly from `[min_backoff_ms, max_backoff_ms]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failed attempts are retried at all
    pub enabled: bool,

    /// Re-attempts allowed after the first failure
    pub max_retries: u32,

    /// Lower bound of the backoff range (milliseconds)
    pub min_backoff_ms: u64,

    /// Upper bound of the backoff range (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            min_backoff_ms: 100,
            max_backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, min_backoff_ms: u64, max_backoff_ms: u64) -> Result<Self> {
        let policy = Self {
            enabled: true,
            max_retries,
            min_backoff_ms,
            max_backoff_ms,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// A policy that never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            min_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(CoreError::InvalidRetryPolicy(format!(
                "min backoff {}ms exceeds max backoff {}ms",
                self.min_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    /// Total number of attempts an action gets under this policy
    pub fn total_attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Whether another attempt is allowed after `failed_attempts` failures
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        self.enabled && failed_attempts < self.total_attempts()
    }

    /// Draw a backoff delay from the configured range
    pub fn backoff_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let low = self.min_backoff_ms.min(self.max_backoff_ms);
        Duration::from_millis(rng.gen_range(low..=self.max_backoff_ms))
    }

    pub fn backoff(&self) -> Duration {
        self.backoff_with(&mut rand::thread_rng())
    }
}
