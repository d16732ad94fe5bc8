//! Exponential backoff retry policy.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::duration_ms;
use crate::resilience::circuit::{CircuitBreaker, CircuitOpenError};

/// Retry limits and backoff shape.
///
/// The delay before retry `n` (zero-based) is `base_delay * multiplier^n`,
/// capped at `max_delay`. With the defaults this is `2^n` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    /// Default: 3
    pub max_retries: u32,
    /// Default: 1 second
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Default: 60 seconds
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Default: 2.0
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Backoff before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `retries_used` retries.
    pub fn allows_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }

    /// Run `operation` until it succeeds or the retry budget is spent.
    ///
    /// When `breaker` is given, every attempt must pass it first; an open
    /// breaker ends the loop without calling `operation`.
    pub async fn execute<F, Fut, T, E>(
        &self,
        resource: &str,
        breaker: Option<&CircuitBreaker>,
        mut operation: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Debug,
    {
        let mut retries = 0;
        loop {
            if let Some(breaker) = breaker {
                breaker.try_acquire().map_err(RetryError::CircuitOpen)?;
            }

            match operation(retries).await {
                Ok(value) => {
                    if let Some(breaker) = breaker {
                        breaker.record_success();
                    }
                    return Ok(Retried { value, retries });
                }
                Err(err) => {
                    if let Some(breaker) = breaker {
                        breaker.record_failure();
                    }
                    if !self.allows_retry(retries) {
                        return Err(RetryError::Exhausted {
                            resource: resource.to_string(),
                            attempts: retries + 1,
                            last: err,
                        });
                    }
                    let delay = self.delay_for(retries);
                    debug!(
                        resource,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }
}

/// A value produced after `retries` additional attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// Terminal outcome of [`RetryPolicy::execute`].
#[derive(Error, Debug)]
pub enum RetryError<E: Display + Debug> {
    #[error("{resource} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        resource: String,
        attempts: u32,
        last: E,
    },

    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
}
