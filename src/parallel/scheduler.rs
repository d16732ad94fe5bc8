//! Wave-by-wave parallel execution of an [`ExecutionGraph`].
//!
//! Groups run strictly in order. Within a group every member is spawned at
//! once and gated by a [`TaskSemaphore`] sized by
//! [`ParallelExecutor::calculate_concurrency`]; the next group starts only
//! after every member of the current one has terminated.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::healing::{FailedAttempt, FailureClassifier, FailureKind, HealingDecision, SelfHealingEngine};
use crate::ledger::AuthorityLedger;
use crate::metrics::{ExecutionStats, ExecutionStatsCollector};
use crate::observe::{Observers, Subscriber};
use crate::parallel::agent::{AgentExecutor, ExecutionContext};
use crate::parallel::dependency::{AgentNode, ExecutionGraph};
use crate::parallel::semaphore::TaskSemaphore;
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
use crate::timeout::{run_with_timeout, TimeoutConfig};

/// Configuration for parallel execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of tasks running at once within a group.
    /// Default: 4
    pub max_concurrency: usize,
    /// Retry budget and backoff for failed attempts.
    pub retry: RetryPolicy,
    /// Per-attempt timeout.
    pub timeout: TimeoutConfig,
    /// Abort the whole run when a critical-path task fails terminally.
    /// Default: true
    pub fail_fast_on_critical: bool,
    /// Memory available to concurrently running tasks.
    /// Default: 4096
    pub memory_budget_mb: u64,
    /// Memory estimate for one running task.
    /// Default: 512
    pub memory_per_task_mb: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            timeout: TimeoutConfig::default(),
            fail_fast_on_critical: true,
            memory_budget_mb: 4096,
            memory_per_task_mb: 512,
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_fail_fast_on_critical(mut self, fail_fast: bool) -> Self {
        self.fail_fast_on_critical = fail_fast;
        self
    }

    pub fn with_memory(mut self, budget_mb: u64, per_task_mb: u64) -> Self {
        self.memory_budget_mb = budget_mb;
        self.memory_per_task_mb = per_task_mb;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("invalid execution graph: {0}")]
    InvalidGraph(String),

    #[error("executor is already running")]
    AlreadyRunning,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Observable executor state.
///
/// Every task id is in exactly one of `completed`, `failed`, `running` or
/// `pending` in every published snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorState {
    pub status: RunStatus,
    pub current_group: Option<usize>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub running: Vec<String>,
    pub pending: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_cost: f64,
}

impl ExecutorState {
    fn starting(order: &[String]) -> Self {
        Self {
            status: RunStatus::Running,
            pending: order.to_vec(),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    fn start(&mut self, task_id: &str) {
        self.pending.retain(|id| id != task_id);
        self.running.push(task_id.to_string());
    }

    fn finish(&mut self, task_id: &str, success: bool) {
        self.pending.retain(|id| id != task_id);
        self.running.retain(|id| id != task_id);
        if success {
            self.completed.push(task_id.to_string());
        } else {
            self.failed.push(task_id.to_string());
        }
    }

    /// Number of tasks tracked.
    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len() + self.running.len() + self.pending.len()
    }

    /// True when the four task lists are pairwise disjoint.
    pub fn is_partitioned(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.completed
            .iter()
            .chain(&self.failed)
            .chain(&self.running)
            .chain(&self.pending)
            .all(|id| seen.insert(id))
    }
}

/// Why a task ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The agent raised an error.
    Agent,
    /// The attempt lost the race against its deadline.
    Timeout,
    /// The task's circuit breaker rejected the attempt.
    CircuitOpen,
    /// The run was aborted before the task could finish.
    Aborted,
    /// The `agent_started` ledger entry could not be written.
    Ledger,
    /// The task panicked.
    Panic,
}

/// Structured context for a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub cause: FailureCause,
    pub message: String,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Outcome of one task for one run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub cost_used: f64,
    #[serde(rename = "duration_ms", with = "crate::config::duration_ms")]
    pub duration: Duration,
    pub error: Option<TaskFailure>,
    pub retries: u32,
    /// A healing strategy rewrote the input or salvaged the output.
    pub healed: bool,
    /// Strategies applied, in order.
    pub strategies: Vec<String>,
}

impl ExecutionResult {
    fn failure(task_id: &str, duration: Duration, retries: u32, failure: TaskFailure) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            output: None,
            cost_used: 0.0,
            duration,
            error: Some(failure),
            retries,
            healed: false,
            strategies: Vec::new(),
        }
    }

    fn aborted(task_id: &str, duration: Duration, retries: u32, reason: &str) -> Self {
        Self::failure(
            task_id,
            duration,
            retries,
            TaskFailure {
                kind: FailureKind::Unknown,
                cause: FailureCause::Aborted,
                message: format!("aborted: {reason}"),
                attempts: retries,
            },
        )
    }

    pub fn was_aborted(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|failure| failure.cause == FailureCause::Aborted)
    }
}

/// Summary of one group's execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub index: usize,
    pub size: usize,
    /// Permits the group's semaphore was created with.
    pub concurrency: usize,
    /// Highest number of permits held at once.
    pub peak_concurrency: usize,
    #[serde(rename = "duration_ms", with = "crate::config::duration_ms")]
    pub duration: Duration,
    pub succeeded: usize,
    pub failed: usize,
    /// Every permit was returned once the group finished.
    pub permits_restored: bool,
}

/// Full result of [`ParallelExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub build_id: String,
    pub status: RunStatus,
    pub results: Vec<ExecutionResult>,
    pub groups: Vec<GroupReport>,
    pub stats: ExecutionStats,
    pub abort_reason: Option<String>,
    pub state: ExecutorState,
}

impl ExecutionReport {
    pub fn result(&self, task_id: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.task_id == task_id)
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.task_id.as_str())
            .collect()
    }
}

/// Cloneable handle for aborting, pausing and resuming a run.
#[derive(Debug, Clone)]
pub struct ExecutorControl {
    cancel: Arc<watch::Sender<bool>>,
    pause: Arc<watch::Sender<bool>>,
    reason: Arc<Mutex<Option<String>>>,
}

impl Default for ExecutorControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorControl {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        let (pause, _) = watch::channel(false);
        Self {
            cancel: Arc::new(cancel),
            pause: Arc::new(pause),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Raise the abort signal. The first reason given is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                warn!(reason = %reason, "execution aborted");
                *slot = Some(reason);
            }
        }
        self.cancel.send_replace(true);
    }

    /// Hold the run before its next group starts.
    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    pub fn is_aborted(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Receiver that flips to `true` when the run is aborted.
    pub fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    async fn wait_for_resume(&self) {
        let mut pause = self.pause.subscribe();
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            _ = async { let _ = pause.wait_for(|paused| !*paused).await; } => {}
            _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => {}
        }
    }
}

/// State shared by every task of one run.
struct RunShared {
    build_id: String,
    config: ExecutorConfig,
    agent: Arc<dyn AgentExecutor>,
    healing: Option<Arc<SelfHealingEngine>>,
    classifier: Arc<FailureClassifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    ledger: Option<Arc<AuthorityLedger>>,
    state: Arc<RwLock<ExecutorState>>,
    observers: Arc<Observers<ExecutorState>>,
    stats: ExecutionStatsCollector,
    control: ExecutorControl,
}

/// Executes an [`ExecutionGraph`] group by group under bounded concurrency.
pub struct ParallelExecutor {
    /// Concurrency, retry, timeout and fail-fast settings.
    config: ExecutorConfig,
    /// The injected agent callback.
    agent: Arc<dyn AgentExecutor>,
    /// Remediation engine consulted after each failed attempt.
    healing: Option<Arc<SelfHealingEngine>>,
    /// Used to classify failures when healing is disabled.
    classifier: Arc<FailureClassifier>,
    /// One breaker per task identity, shared across runs.
    breakers: Arc<CircuitBreakerRegistry>,
    /// Ledger receiving agent lifecycle entries, if attached.
    ledger: Option<Arc<AuthorityLedger>>,
    /// Live state, readable while a run is in progress.
    state: Arc<RwLock<ExecutorState>>,
    /// Subscribers to state snapshots.
    observers: Arc<Observers<ExecutorState>>,
    control: ExecutorControl,
    running: AtomicBool,
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.config)
            .field("healing", &self.healing.is_some())
            .field("ledger", &self.ledger.is_some())
            .finish_non_exhaustive()
    }
}

impl ParallelExecutor {
    pub fn new(config: ExecutorConfig, agent: Arc<dyn AgentExecutor>) -> Self {
        Self {
            config,
            agent,
            healing: Some(Arc::new(SelfHealingEngine::default())),
            classifier: Arc::new(FailureClassifier::new()),
            breakers: Arc::new(CircuitBreakerRegistry::default()),
            ledger: None,
            state: Arc::new(RwLock::new(ExecutorState::default())),
            observers: Arc::new(Observers::new("executor_state")),
            control: ExecutorControl::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_healing(mut self, healing: Arc<SelfHealingEngine>) -> Self {
        self.healing = Some(healing);
        self
    }

    pub fn without_healing(mut self) -> Self {
        self.healing = None;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<AuthorityLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn control(&self) -> ExecutorControl {
        self.control.clone()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Subscribe to state snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorState> {
        self.observers.subscribe()
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber<ExecutorState>>) {
        self.observers.add_subscriber(subscriber);
    }

    /// Current state snapshot.
    pub async fn state(&self) -> ExecutorState {
        self.state.read().await.clone()
    }

    /// Permits for a group of `group_size` tasks: the least of the configured
    /// cap, the group size and the memory-derived estimate, never below one.
    pub fn calculate_concurrency(&self, group_size: usize) -> usize {
        let by_memory = if self.config.memory_per_task_mb == 0 {
            usize::MAX
        } else {
            (self.config.memory_budget_mb / self.config.memory_per_task_mb) as usize
        };
        self.config
            .max_concurrency
            .min(group_size)
            .min(by_memory)
            .max(1)
    }

    /// Run every group of `graph` in order.
    pub async fn execute(&self, build_id: &str, graph: &ExecutionGraph) -> Result<ExecutionReport, ExecutorError> {
        validate_groups(graph)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);
        if let Some(healing) = &self.healing {
            // A rerun under the same build id starts with a clean failure history.
            healing.release_build(build_id);
        }

        let run_started = Instant::now();
        let shared = Arc::new(RunShared {
            build_id: build_id.to_string(),
            config: self.config.clone(),
            agent: Arc::clone(&self.agent),
            healing: self.healing.clone(),
            classifier: Arc::clone(&self.classifier),
            breakers: Arc::clone(&self.breakers),
            ledger: self.ledger.clone(),
            state: Arc::clone(&self.state),
            observers: Arc::clone(&self.observers),
            stats: ExecutionStatsCollector::new(self.config.max_concurrency),
            control: self.control.clone(),
        });

        self.update_state(|state| *state = ExecutorState::starting(&graph.execution_order))
            .await;
        info!(
            build_id,
            tasks = graph.len(),
            groups = graph.parallel_groups.len(),
            "execution started"
        );

        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut results = Vec::with_capacity(graph.len());
        let mut groups = Vec::with_capacity(graph.parallel_groups.len());

        for group in &graph.parallel_groups {
            if self.control.is_paused() && !self.control.is_aborted() {
                self.update_state(|state| state.status = RunStatus::Paused).await;
                info!(build_id, group = group.index, "execution paused");
                self.control.wait_for_resume().await;
                self.update_state(|state| state.status = RunStatus::Running).await;
            }
            if self.control.is_aborted() {
                info!(build_id, group = group.index, "skipping remaining groups after abort");
                break;
            }

            let index = group.index;
            self.update_state(|state| state.current_group = Some(index)).await;

            let concurrency = self.calculate_concurrency(group.len());
            let semaphore = TaskSemaphore::new(concurrency);
            let prior_outputs = Arc::new(outputs.clone());
            let group_started = Instant::now();
            debug!(build_id, group = index, size = group.len(), concurrency, "group started");

            let mut join_set = JoinSet::new();
            for node in group.agents.iter().filter_map(|id| graph.node(id)) {
                let node = node.clone();
                let shared = Arc::clone(&shared);
                let semaphore = semaphore.clone();
                let prior_outputs = Arc::clone(&prior_outputs);
                join_set.spawn(async move {
                    let task_id = node.id.clone();
                    let task = run_task(Arc::clone(&shared), semaphore, node.clone(), prior_outputs);
                    match AssertUnwindSafe(task).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            error!(task_id = %task_id, "task panicked");
                            let result = ExecutionResult::failure(
                                &task_id,
                                Duration::ZERO,
                                0,
                                TaskFailure {
                                    kind: FailureKind::Unknown,
                                    cause: FailureCause::Panic,
                                    message: "task panicked".to_string(),
                                    attempts: 1,
                                },
                            );
                            shared.settle(&node, &result, true).await;
                            result
                        }
                    }
                });
            }

            let mut group_results = Vec::with_capacity(group.len());
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => group_results.push(result),
                    Err(err) => error!(build_id, group = index, error = %err, "task join failed"),
                }
            }
            group_results.sort_by_key(|result| {
                group
                    .agents
                    .iter()
                    .position(|id| *id == result.task_id)
                    .unwrap_or(usize::MAX)
            });

            for result in &group_results {
                if let (true, Some(output)) = (result.success, &result.output) {
                    outputs.insert(result.task_id.clone(), output.clone());
                }
            }

            let succeeded = group_results.iter().filter(|r| r.success).count();
            let report = GroupReport {
                index,
                size: group.len(),
                concurrency,
                peak_concurrency: semaphore.peak(),
                duration: group_started.elapsed(),
                succeeded,
                failed: group_results.len() - succeeded,
                permits_restored: semaphore.is_idle(),
            };
            if !report.permits_restored {
                error!(build_id, group = index, available = semaphore.available(), "permits leaked");
            }
            info!(
                build_id,
                group = index,
                succeeded = report.succeeded,
                failed = report.failed,
                peak = report.peak_concurrency,
                duration_ms = report.duration.as_millis() as u64,
                "group finished"
            );
            groups.push(report);
            results.extend(group_results);

            // Snapshot after the group.
            self.update_state(|_| {}).await;
        }

        let abort_reason = self.control.abort_reason();
        let all_succeeded = results.len() == graph.len() && results.iter().all(|r| r.success);
        let status = if abort_reason.is_none() && all_succeeded {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let state = self
            .update_state(|state| {
                state.status = status;
                state.ended_at = Some(Utc::now());
            })
            .await;

        let stats = shared.stats.finish_with(run_started.elapsed());
        info!(
            build_id,
            status = ?status,
            speedup = stats.speedup,
            efficiency = stats.efficiency,
            "execution finished"
        );

        Ok(ExecutionReport {
            build_id: build_id.to_string(),
            status,
            results,
            groups,
            stats,
            abort_reason,
            state,
        })
    }

    async fn update_state<F>(&self, change: F) -> ExecutorState
    where
        F: FnOnce(&mut ExecutorState),
    {
        let snapshot = {
            let mut state = self.state.write().await;
            change(&mut state);
            state.clone()
        };
        self.observers.publish(&snapshot);
        snapshot
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn validate_groups(graph: &ExecutionGraph) -> Result<(), ExecutorError> {
    let mut seen = std::collections::HashSet::new();
    for group in &graph.parallel_groups {
        for id in &group.agents {
            if graph.node(id).is_none() {
                return Err(ExecutorError::InvalidGraph(format!(
                    "group {} references unknown agent {id}",
                    group.index
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(ExecutorError::InvalidGraph(format!("agent {id} appears in more than one group")));
            }
        }
    }
    if seen.len() != graph.len() {
        return Err(ExecutorError::InvalidGraph(format!(
            "{} of {} agents are assigned to a group",
            seen.len(),
            graph.len()
        )));
    }
    Ok(())
}

async fn run_task(
    shared: Arc<RunShared>,
    semaphore: TaskSemaphore,
    node: AgentNode,
    prior_outputs: Arc<HashMap<String, Value>>,
) -> ExecutionResult {
    let started = Instant::now();

    let permit = match semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => {
            let result = ExecutionResult::aborted(&node.id, started.elapsed(), 0, "semaphore closed");
            shared.settle(&node, &result, false).await;
            return result;
        }
    };

    if shared.control.is_aborted() {
        let reason = shared.control.abort_reason().unwrap_or_default();
        let result = ExecutionResult::aborted(&node.id, started.elapsed(), 0, &reason);
        shared.settle(&node, &result, false).await;
        return result;
    }

    shared.mark_running(&node.id, &semaphore).await;
    let (result, announced) = shared.attempt(&node, prior_outputs, started).await;
    shared.settle(&node, &result, announced).await;

    // Released only after the state no longer lists the task as running.
    drop(permit);
    result
}

impl RunShared {
    async fn mark_running(&self, task_id: &str, semaphore: &TaskSemaphore) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.start(task_id);
            state.clone()
        };
        self.stats.observe_concurrency(semaphore.in_use());
        debug!(build_id = %self.build_id, task_id, "task started");
        self.observers.publish(&snapshot);
    }

    /// Run attempts until one succeeds, the retry budget is spent, or the run aborts.
    ///
    /// The flag is true once the task passed its breaker and was announced
    /// (ledgered as `agent_started` when a ledger is attached).
    async fn attempt(
        &self,
        node: &AgentNode,
        prior_outputs: Arc<HashMap<String, Value>>,
        started: Instant,
    ) -> (ExecutionResult, bool) {
        let task_id = node.id.as_str();
        let breaker = self.breakers.breaker(task_id);
        let mut cancel = self.control.cancel_receiver();
        let mut input = node.config.clone();
        let mut retries = 0;
        let mut healed = false;
        let mut strategies = Vec::new();
        let mut announced = false;

        loop {
            if *cancel.borrow() {
                let reason = self.control.abort_reason().unwrap_or_default();
                let result = ExecutionResult::aborted(task_id, started.elapsed(), retries, &reason);
                return (with_healing(result, healed, strategies), announced);
            }

            if let Err(open) = breaker.try_acquire() {
                warn!(build_id = %self.build_id, task_id, error = %open, "attempt rejected by open circuit");
                if !announced {
                    self.ledger_rejection(task_id, &open.to_string());
                }
                let failure = TaskFailure {
                    kind: FailureKind::Unknown,
                    cause: FailureCause::CircuitOpen,
                    message: open.to_string(),
                    attempts: retries,
                };
                let result = ExecutionResult::failure(task_id, started.elapsed(), retries, failure);
                return (with_healing(result, healed, strategies), announced);
            }

            if let (false, Some(ledger)) = (announced, &self.ledger) {
                if let Err(err) = ledger.agent_started(&self.build_id, task_id, &node.phase_id) {
                    error!(build_id = %self.build_id, task_id, error = %err, "agent_started write failed; task not run");
                    let failure = TaskFailure {
                        kind: FailureKind::Unknown,
                        cause: FailureCause::Ledger,
                        message: err.to_string(),
                        attempts: 0,
                    };
                    return (ExecutionResult::failure(task_id, started.elapsed(), 0, failure), false);
                }
            }
            announced = true;

            let ctx = ExecutionContext {
                build_id: self.build_id.clone(),
                phase_id: (!node.phase_id.is_empty()).then(|| node.phase_id.clone()),
                attempt: retries,
                prior_outputs: Arc::clone(&prior_outputs),
                cancel: cancel.clone(),
            };
            let limit = self.config.timeout.timeout_for(&input);
            let outcome = run_with_timeout(task_id, limit, self.agent.execute(task_id, &input, ctx)).await;

            let (cause, message, raw_output) = match outcome {
                Ok(Ok(output)) => {
                    breaker.record_success();
                    let result = ExecutionResult {
                        task_id: task_id.to_string(),
                        success: true,
                        output: Some(output.output),
                        cost_used: output.cost_used,
                        duration: started.elapsed(),
                        error: None,
                        retries,
                        healed,
                        strategies,
                    };
                    return (result, true);
                }
                Ok(Err(err)) => (FailureCause::Agent, err.message, err.output),
                Err(timed_out) => (FailureCause::Timeout, timed_out.to_string(), None),
            };
            breaker.record_failure();

            if *cancel.borrow() {
                continue;
            }

            let mut kind = self.classifier.classify(&message);
            let mut next_input = None;
            let mut delay = None;
            if let Some(healing) = self.healing.as_ref().filter(|h| h.config().enabled) {
                let decision = healing.heal(FailedAttempt {
                    build_id: &self.build_id,
                    task_id,
                    message: &message,
                    attempt: retries + 1,
                    input: &input,
                    output: raw_output.as_deref(),
                });
                kind = decision.kind();
                match decision {
                    HealingDecision::Partial { strategy, result, .. } => {
                        strategies.push(strategy.to_string());
                        let result = ExecutionResult {
                            task_id: task_id.to_string(),
                            success: true,
                            output: Some(result),
                            cost_used: 0.0,
                            duration: started.elapsed(),
                            error: None,
                            retries,
                            healed: true,
                            strategies,
                        };
                        return (result, true);
                    }
                    HealingDecision::Retry {
                        strategy,
                        input: new_input,
                        delay: wait,
                        ..
                    } => {
                        strategies.push(strategy.to_string());
                        next_input = new_input;
                        delay = wait;
                    }
                    HealingDecision::Unrecoverable { .. } => {}
                }
            }

            if !self.config.retry.allows_retry(retries) {
                warn!(
                    build_id = %self.build_id,
                    task_id,
                    kind = %kind,
                    attempts = retries + 1,
                    error = %message,
                    "task failed"
                );
                let failure = TaskFailure {
                    kind,
                    cause,
                    message,
                    attempts: retries + 1,
                };
                let result = ExecutionResult::failure(task_id, started.elapsed(), retries, failure);
                return (with_healing(result, healed, strategies), true);
            }

            let wait = delay.unwrap_or_else(|| self.config.retry.delay_for(retries));
            debug!(
                build_id = %self.build_id,
                task_id,
                kind = %kind,
                attempt = retries + 1,
                delay_ms = wait.as_millis() as u64,
                "retrying task"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => {}
            }

            if let Some(new_input) = next_input {
                healed = true;
                input = new_input;
            }
            retries += 1;
        }
    }

    /// Record a terminal result and apply fail-fast.
    ///
    /// `announced` is false when no `agent_started` entry was written, so
    /// there is nothing for the ledger to close.
    async fn settle(&self, node: &AgentNode, result: &ExecutionResult, announced: bool) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.finish(&result.task_id, result.success);
            state.total_cost += result.cost_used;
            state.clone()
        };

        let failure_kind = result.error.as_ref().map(|failure| failure.kind);
        self.stats.complete_task(
            &result.task_id,
            result.success,
            result.retries + 1,
            result.duration,
            result.cost_used,
            failure_kind,
            result.healed,
        );

        if let Some(ledger) = self.ledger.as_ref().filter(|_| announced) {
            if let Err(err) = self.ledger_result(ledger, result, snapshot.total_cost) {
                error!(build_id = %self.build_id, task_id = %result.task_id, error = %err, "ledger write failed");
                self.control.abort(format!("ledger write failed for {}: {err}", result.task_id));
            }
        }

        self.observers.publish(&snapshot);

        if !result.success && !result.was_aborted() && node.is_critical && self.config.fail_fast_on_critical {
            self.control
                .abort(format!("critical task {} failed", result.task_id));
        }
    }

    /// Ledger a task turned away by its breaker before it ever ran.
    fn ledger_rejection(&self, task_id: &str, message: &str) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(err) = ledger.error(&self.build_id, "circuit_breaker", &format!("{task_id}: {message}")) {
            error!(build_id = %self.build_id, task_id, error = %err, "ledger write failed");
            self.control.abort(format!("ledger write failed for {task_id}: {err}"));
        }
    }

    fn ledger_result(
        &self,
        ledger: &AuthorityLedger,
        result: &ExecutionResult,
        cumulative_cost: f64,
    ) -> Result<(), crate::ledger::LedgerError> {
        match &result.error {
            None => {
                ledger.agent_completed(
                    &self.build_id,
                    &result.task_id,
                    result.duration,
                    result.retries,
                    result.cost_used,
                )?;
            }
            Some(failure) => {
                ledger.agent_failed(
                    &self.build_id,
                    &result.task_id,
                    failure.kind.as_str(),
                    &failure.message,
                    failure.attempts,
                )?;
            }
        }
        if result.cost_used > 0.0 {
            ledger.cost_updated(&self.build_id, Some(&result.task_id), result.cost_used, cumulative_cost)?;
        }
        Ok(())
    }
}

fn with_healing(mut result: ExecutionResult, healed: bool, strategies: Vec<String>) -> ExecutionResult {
    result.healed = healed;
    result.strategies = strategies;
    result
}
