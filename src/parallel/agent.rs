//! The injected agent executor contract.
//!
//! The scheduler never knows what an agent does. It hands the task id, the
//! node's opaque config and an [`ExecutionContext`] to an [`AgentExecutor`]
//! and gets back an [`AgentOutput`] or an [`AgentError`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::watch;

/// Key in a node's config read by [`DryRunExecutor`].
pub const SIMULATE_KEY: &str = "simulate";

/// Successful agent result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: Value,
    pub cost_used: f64,
}

impl AgentOutput {
    pub fn new(output: Value, cost_used: f64) -> Self {
        Self { output, cost_used }
    }
}

/// Failure raised by an agent.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    /// Raw output produced before failing, if any. Used for output repair.
    pub output: Option<String>,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Everything an agent may know about the run it belongs to.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub build_id: String,
    pub phase_id: Option<String>,
    /// Zero-based attempt index for this task.
    pub attempt: u32,
    /// Outputs of tasks that completed before this one started.
    pub prior_outputs: Arc<HashMap<String, Value>>,
    pub cancel: watch::Receiver<bool>,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the build is cancelled. Never resolves if the sender is gone.
    pub async fn cancelled(&mut self) {
        if self.cancel.wait_for(|cancelled| *cancelled).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Executes one agent task.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        task_id: &str,
        config: &Value,
        ctx: ExecutionContext,
    ) -> Result<AgentOutput, AgentError>;
}

type ExecFn =
    dyn Fn(String, Value, ExecutionContext) -> BoxFuture<'static, Result<AgentOutput, AgentError>> + Send + Sync;

/// Adapts a closure into an [`AgentExecutor`].
pub struct FnExecutor {
    f: Box<ExecFn>,
}

impl FnExecutor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(String, Value, ExecutionContext) -> BoxFuture<'static, Result<AgentOutput, AgentError>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

impl std::fmt::Debug for FnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl AgentExecutor for FnExecutor {
    async fn execute(
        &self,
        task_id: &str,
        config: &Value,
        ctx: ExecutionContext,
    ) -> Result<AgentOutput, AgentError> {
        (self.f)(task_id.to_string(), config.clone(), ctx).await
    }
}

/// Simulation settings read from a node's `simulate` config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Simulation {
    pub duration_ms: u64,
    pub cost: f64,
    /// Number of leading attempts that fail.
    pub fail_times: u32,
    /// Fail every attempt.
    pub fail_always: bool,
    pub error: Option<String>,
    /// Raw output attached to simulated failures.
    pub raw_output: Option<String>,
    pub output: Option<Value>,
}

/// Executes nodes by sleeping for their simulated duration.
///
/// Failures are scripted per node through the `simulate` config key, so
/// plans can exercise retry and healing paths without a real agent.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    attempts: Mutex<HashMap<String, u32>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts seen so far for `task_id`.
    pub fn attempts(&self, task_id: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.get(task_id).copied().unwrap_or(0)
    }

    fn next_attempt(&self, task_id: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = attempts.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl AgentExecutor for DryRunExecutor {
    async fn execute(
        &self,
        task_id: &str,
        config: &Value,
        mut ctx: ExecutionContext,
    ) -> Result<AgentOutput, AgentError> {
        let simulation: Simulation = config
            .get(SIMULATE_KEY)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| AgentError::new(format!("invalid simulate config: {err}")))?
            .unwrap_or_default();
        let attempt = self.next_attempt(task_id);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(simulation.duration_ms)) => {}
            _ = ctx.cancelled() => return Err(AgentError::new(format!("{task_id} cancelled"))),
        }

        if simulation.fail_always || attempt <= simulation.fail_times {
            let message = simulation
                .error
                .clone()
                .unwrap_or_else(|| format!("simulated failure of {task_id}"));
            let mut error = AgentError::new(message);
            if let Some(raw) = simulation.raw_output {
                error = error.with_output(raw);
            }
            return Err(error);
        }

        let output = simulation.output.unwrap_or_else(|| {
            json!({
                "task_id": task_id,
                "attempt": attempt,
                "dependencies_seen": ctx.prior_outputs.len(),
            })
        });
        Ok(AgentOutput::new(output, simulation.cost))
    }
}
