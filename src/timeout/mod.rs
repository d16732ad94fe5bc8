//! Per-task timeout configuration and the timeout race.
//!
//! Timeouts apply to a single task attempt, never to a whole group or build.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::duration_ms;

/// Key in an agent's opaque config that overrides the default task timeout.
pub const TIMEOUT_OVERRIDE_KEY: &str = "timeout_ms";

/// Error produced when an attempt loses the race against its deadline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task {task_id} timed out after {}ms", .limit.as_millis())]
pub struct TaskTimedOut {
    pub task_id: String,
    pub limit: Duration,
}

/// Configuration for timeout behavior during task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum time allowed for one attempt of one task.
    /// Default: 300 seconds
    #[serde(rename = "task_timeout_ms", with = "duration_ms")]
    pub task_timeout: Duration,

    /// Lower bound applied to per-task overrides, so a config typo cannot
    /// produce a zero deadline.
    /// Default: 10 milliseconds
    #[serde(rename = "min_task_timeout_ms", with = "duration_ms")]
    pub min_task_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            min_task_timeout: Duration::from_millis(10),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-task timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the floor for per-task overrides.
    pub fn with_min_task_timeout(mut self, timeout: Duration) -> Self {
        self.min_task_timeout = timeout;
        self
    }

    /// Resolve the deadline for a task, honoring a `timeout_ms` override in its config.
    pub fn timeout_for(&self, task_config: &Value) -> Duration {
        task_config
            .get(TIMEOUT_OVERRIDE_KEY)
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .map(|limit| limit.max(self.min_task_timeout))
            .unwrap_or(self.task_timeout)
    }
}

/// Race `future` against `limit`.
pub async fn run_with_timeout<F, T>(
    task_id: &str,
    limit: Duration,
    future: F,
) -> Result<T, TaskTimedOut>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| TaskTimedOut {
            task_id: task_id.to_string(),
            limit,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_task_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.task_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_builder_pattern() {
        let config = TimeoutConfig::new()
            .with_task_timeout(Duration::from_secs(30))
            .with_min_task_timeout(Duration::from_millis(50));

        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert_eq!(config.min_task_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_override_from_task_config() {
        let config = TimeoutConfig::new().with_task_timeout(Duration::from_secs(30));

        assert_eq!(
            config.timeout_for(&json!({"timeout_ms": 2500})),
            Duration::from_millis(2500)
        );
        assert_eq!(config.timeout_for(&json!({"timeout_ms": 0})), Duration::from_millis(10));
        assert_eq!(config.timeout_for(&json!({"other": 1})), Duration::from_secs(30));
        assert_eq!(config.timeout_for(&Value::Null), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_run_with_timeout_completes_in_time() {
        let result = run_with_timeout("fast", Duration::from_millis(200), async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_run_with_timeout_expires() {
        let result = run_with_timeout("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.task_id, "slow");
        assert!(err.to_string().contains("timed out after 10ms"));
    }
}
