//! Circuit breakers keyed by resource identity.
//!
//! A breaker moves `Closed -> Open` after `failure_threshold` consecutive
//! failures, lets trial calls through once `reset_timeout` has elapsed
//! (`HalfOpen`), and closes again after `success_threshold` trial successes.
//! Any trial failure reopens it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::duration_ms;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when a call is rejected by an open breaker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit open for {resource}; retry in {}ms", .retry_in.as_millis())]
pub struct CircuitOpenError {
    pub resource: String,
    pub retry_in: Duration,
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    /// Default: 5
    pub failure_threshold: u32,
    /// Trial successes in half-open state that close it again.
    /// Default: 2
    pub success_threshold: u32,
    /// Cool-down before an open breaker admits trial calls.
    /// Default: 30 seconds
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub resource: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Closed / open / half-open state machine for one resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    resource: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            resource: resource.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current state, moving `Open` to `HalfOpen` if the cool-down has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Admit or reject a call. Rejection never invokes the caller's work.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(CircuitOpenError {
                    resource: self.resource.clone(),
                    retry_in: self.config.reset_timeout.saturating_sub(elapsed),
                })
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(resource = %self.resource, "circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        resource = %self.resource,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(resource = %self.resource, "trial call failed; circuit reopened");
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            resource: self.resource.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.config.reset_timeout)
        {
            info!(resource = %self.resource, "circuit half-open");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One breaker per resource, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The breaker for `resource`, creating it closed if absent.
    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(resource, self.config.clone()))),
        )
    }

    /// Snapshots of every breaker, sorted by resource.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.resource.cmp(&b.resource));
        snapshots
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}
