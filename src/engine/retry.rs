//! Retry with Exponential Backoff
//!
//! Bounded retries for storage calls that fail with a transient error.
//! Validation, integrity and permission failures are returned immediately.

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::warn;

use super::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    6000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Run `f`, retrying retryable errors until the attempt budget is spent.
    pub fn run<T, F>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient storage error, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::EngineError;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(6000));
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let mut calls = 0;
        let out = fast().run("read", || {
            calls += 1;
            if calls < 3 {
                Err(EngineError::Operation("busy".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_budget() {
        let mut calls = 0;
        let out: Result<()> = fast().run("read", || {
            calls += 1;
            Err(EngineError::Operation("down".into()))
        });
        assert!(out.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_non_retryable_fails_fast() {
        let mut calls = 0;
        let out: Result<()> = fast().run("read", || {
            calls += 1;
            Err(EngineError::Integrity("bad checksum".into()))
        });
        assert!(matches!(out, Err(EngineError::Integrity(_))));
        assert_eq!(calls, 1);
    }
}
