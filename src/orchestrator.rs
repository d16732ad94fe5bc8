//! Build sessions: authorize, ledger, then execute.
//!
//! [`BuildOrchestrator`] owns the per-build lifetime. A run opens the build
//! in the [`AuthorityEngine`], asks for `build_start`, writes `build_started`,
//! and only then hands the graph to a [`ParallelExecutor`] through
//! [`AuthorityEngine::execute_authorized`]. Pause, resume and cancel go
//! through the same gate while the run is live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::authority::{
    ActionType, AuthorityEngine, AuthorityError, AuthorizationDenial, AuthorizationGrant, AuthorizationOutcome,
    AuthorizationRequest, Role, TrustLevel,
};
use crate::config::EngineConfig;
use crate::healing::SelfHealingEngine;
use crate::ledger::{AuthorityLedger, LedgerError};
use crate::parallel::{
    AgentExecutor, AgentNode, DependencyGraphBuilder, ExecutionGraph, ExecutionReport, ExecutorControl,
    ExecutorError, GraphError, ParallelExecutor,
};
use crate::resilience::CircuitBreakerRegistry;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid build plan: {0}")]
    Plan(#[from] GraphError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("build {0} is already running")]
    AlreadyRunning(String),

    #[error("build {0} is not running")]
    NotRunning(String),
}

/// Why a guarded run did not succeed.
#[derive(Error, Debug)]
enum RunFailure {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("{0}")]
    Tasks(String),
}

/// A finished run.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRun {
    pub build_id: String,
    pub grant: AuthorizationGrant,
    pub report: ExecutionReport,
    pub trust: TrustLevel,
    pub cancelled: bool,
}

/// Result of [`BuildOrchestrator::run_build`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BuildOutcome {
    Denied(AuthorizationDenial),
    Completed(BuildRun),
    Failed(BuildRun),
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, BuildOutcome::Completed(_))
    }

    pub fn run(&self) -> Option<&BuildRun> {
        match self {
            BuildOutcome::Completed(run) | BuildOutcome::Failed(run) => Some(run),
            BuildOutcome::Denied(_) => None,
        }
    }
}

#[derive(Debug)]
struct ActiveBuild {
    control: ExecutorControl,
    cancelled: bool,
}

/// Runs builds end to end against one authority engine and ledger.
pub struct BuildOrchestrator {
    config: EngineConfig,
    authority: Arc<AuthorityEngine>,
    agent: Arc<dyn AgentExecutor>,
    healing: Arc<SelfHealingEngine>,
    breakers: Arc<CircuitBreakerRegistry>,
    active: Mutex<HashMap<String, ActiveBuild>>,
}

impl BuildOrchestrator {
    pub fn new(config: EngineConfig, authority: Arc<AuthorityEngine>, agent: Arc<dyn AgentExecutor>) -> Self {
        Self {
            healing: Arc::new(SelfHealingEngine::new(config.healing.clone())),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit.clone())),
            config,
            authority,
            agent,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn authority(&self) -> &Arc<AuthorityEngine> {
        &self.authority
    }

    pub fn ledger(&self) -> &Arc<AuthorityLedger> {
        self.authority.ledger()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveBuild>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, build_id: &str) -> bool {
        self.active().contains_key(build_id)
    }

    /// Validate `nodes` into an execution plan without running anything.
    pub fn plan(&self, nodes: Vec<AgentNode>) -> Result<ExecutionGraph, OrchestratorError> {
        Ok(DependencyGraphBuilder::new().build(nodes)?)
    }

    /// Authorize and run a build.
    ///
    /// A denied `build_start` is returned as [`BuildOutcome::Denied`] and
    /// nothing is executed. Task failures end as [`BuildOutcome::Failed`]
    /// with the full report; the build's trust pays the execution-failure
    /// penalty.
    pub async fn run_build(
        &self,
        build_id: &str,
        nodes: Vec<AgentNode>,
        actor_id: &str,
        role: Role,
    ) -> Result<BuildOutcome, OrchestratorError> {
        let graph = self.plan(nodes)?;
        if self.is_running(build_id) {
            return Err(OrchestratorError::AlreadyRunning(build_id.to_string()));
        }
        self.authority.open_build(build_id);

        let request = AuthorizationRequest::for_action(build_id, ActionType::BuildStart, actor_id, role).with_context(
            json!({
                "tasks": graph.len(),
                "groups": graph.parallel_groups.len(),
                "estimated_cost": graph.estimated_total_cost,
                "estimated_duration_ms": graph.estimated_total_duration.as_millis() as u64,
            }),
        );
        let grant = match self.authority.request_authorization(request).await? {
            AuthorizationOutcome::Granted(grant) => grant,
            AuthorizationOutcome::Denied(denial) => {
                warn!(build_id, actor = actor_id, reason = %denial.reason(), "build start denied");
                return Ok(BuildOutcome::Denied(denial));
            }
        };

        self.ledger().build_started(
            build_id,
            Some(actor_id),
            json!({
                "request_id": grant.request_id,
                "tasks": graph.execution_order,
                "critical_path": graph.critical_path,
                "critical_path_duration_ms": graph.critical_path_duration.as_millis() as u64,
            }),
        )?;
        info!(build_id, tasks = graph.len(), groups = graph.parallel_groups.len(), "build started");

        let executor = ParallelExecutor::new(self.config.executor.clone(), Arc::clone(&self.agent))
            .with_healing(Arc::clone(&self.healing))
            .with_breakers(Arc::clone(&self.breakers))
            .with_ledger(Arc::clone(self.ledger()));
        {
            let mut active = self.active();
            if active.contains_key(build_id) {
                return Err(OrchestratorError::AlreadyRunning(build_id.to_string()));
            }
            active.insert(
                build_id.to_string(),
                ActiveBuild {
                    control: executor.control(),
                    cancelled: false,
                },
            );
        }

        let mut report_slot: Option<ExecutionReport> = None;
        let slot = &mut report_slot;
        let executor = &executor;
        let graph = &graph;
        let guarded = self
            .authority
            .execute_authorized(build_id, &grant.request_id, || async move {
                let report = executor.execute(build_id, graph).await?;
                let outcome: Result<(), RunFailure> = if report.succeeded() {
                    Ok(())
                } else {
                    Err(RunFailure::Tasks(failure_reason(&report)))
                };
                *slot = Some(report);
                outcome
            })
            .await;

        let cancelled = self.active().remove(build_id).is_some_and(|build| build.cancelled);

        let Some(report) = report_slot else {
            let err = guarded.err().unwrap_or_else(|| AuthorityError::ActionFailed {
                action: ActionType::BuildStart,
                message: "executor produced no report".to_string(),
            });
            self.ledger().build_failed(build_id, &err.to_string(), json!({}))?;
            warn!(build_id, reason = %err, "build failed before execution");
            return Err(err.into());
        };

        let summary = report_summary(&report);
        match &guarded {
            Ok(()) => {
                self.ledger().build_completed(build_id, summary)?;
                info!(
                    build_id,
                    succeeded = report.stats.succeeded,
                    speedup = report.stats.speedup,
                    "build completed"
                );
            }
            // The cancel path already wrote `build_cancelled`.
            Err(_) if cancelled => {
                info!(build_id, "build cancelled");
            }
            Err(err) => {
                self.ledger().build_failed(build_id, &err.to_string(), summary)?;
                warn!(build_id, failed = report.stats.failed, reason = %err, "build failed");
            }
        }
        if let Err(err @ (AuthorityError::Ledger(_) | AuthorityError::UnknownBuild(_))) = guarded {
            return Err(err.into());
        }

        let run = BuildRun {
            build_id: build_id.to_string(),
            trust: self.authority.trust(build_id)?,
            grant,
            cancelled,
            report,
        };
        Ok(if run.report.succeeded() {
            BuildOutcome::Completed(run)
        } else {
            BuildOutcome::Failed(run)
        })
    }

    /// Pause a running build between groups.
    pub async fn pause_build(
        &self,
        build_id: &str,
        actor_id: &str,
        role: Role,
        reason: &str,
    ) -> Result<AuthorizationOutcome, OrchestratorError> {
        let control = self.control(build_id)?;
        self.gated(build_id, ActionType::BuildPause, actor_id, role, json!({ "reason": reason }), || {
            self.ledger().build_paused(build_id, Some(actor_id), reason)?;
            control.pause();
            Ok(())
        })
        .await
    }

    pub async fn resume_build(
        &self,
        build_id: &str,
        actor_id: &str,
        role: Role,
    ) -> Result<AuthorizationOutcome, OrchestratorError> {
        let control = self.control(build_id)?;
        self.gated(build_id, ActionType::BuildResume, actor_id, role, json!({}), || {
            self.ledger().build_resumed(build_id, Some(actor_id))?;
            control.resume();
            Ok(())
        })
        .await
    }

    /// Abort a running build. Running tasks are cancelled; pending tasks never start.
    pub async fn cancel_build(
        &self,
        build_id: &str,
        actor_id: &str,
        role: Role,
        reason: &str,
    ) -> Result<AuthorizationOutcome, OrchestratorError> {
        let control = self.control(build_id)?;
        self.gated(build_id, ActionType::BuildCancel, actor_id, role, json!({ "reason": reason }), || {
            self.ledger().build_cancelled(build_id, Some(actor_id), reason)?;
            if let Some(build) = self.active().get_mut(build_id) {
                build.cancelled = true;
            }
            control.abort(reason);
            Ok(())
        })
        .await
    }

    /// Dispose of a build's authority state once its run is over.
    pub fn finish_build(&self, build_id: &str) -> Result<TrustLevel, OrchestratorError> {
        if self.is_running(build_id) {
            return Err(OrchestratorError::AlreadyRunning(build_id.to_string()));
        }
        let trust = self.authority.close_build(build_id)?;
        self.healing.release_build(build_id);
        Ok(trust)
    }

    pub fn healing(&self) -> &Arc<SelfHealingEngine> {
        &self.healing
    }

    fn control(&self, build_id: &str) -> Result<ExecutorControl, OrchestratorError> {
        self.active()
            .get(build_id)
            .map(|build| build.control.clone())
            .ok_or_else(|| OrchestratorError::NotRunning(build_id.to_string()))
    }

    /// Authorize `action`, then apply `effect` under the grant.
    async fn gated<F>(
        &self,
        build_id: &str,
        action: ActionType,
        actor_id: &str,
        role: Role,
        context: Value,
        effect: F,
    ) -> Result<AuthorizationOutcome, OrchestratorError>
    where
        F: FnOnce() -> Result<(), LedgerError>,
    {
        let request = AuthorizationRequest::for_action(build_id, action, actor_id, role).with_context(context);
        let outcome = self.authority.request_authorization(request).await?;
        if let AuthorizationOutcome::Granted(grant) = &outcome {
            self.authority
                .execute_authorized(build_id, &grant.request_id, || async move { effect() })
                .await?;
        }
        Ok(outcome)
    }
}

fn failure_reason(report: &ExecutionReport) -> String {
    if let Some(reason) = &report.abort_reason {
        return format!("aborted: {reason}");
    }
    let failed = report.failed_tasks();
    if failed.is_empty() {
        return format!("run ended {:?}", report.status).to_lowercase();
    }
    format!("{} task(s) failed: {}", failed.len(), failed.join(", "))
}

fn report_summary(report: &ExecutionReport) -> Value {
    json!({
        "status": report.status,
        "succeeded": report.stats.succeeded,
        "failed": report.stats.failed,
        "failed_tasks": report.failed_tasks(),
        "total_retries": report.stats.total_retries,
        "healed_tasks": report.stats.healed_tasks,
        "total_cost": report.stats.total_cost,
        "wall_clock_ms": report.stats.wall_clock.as_millis() as u64,
        "speedup": report.stats.speedup,
        "abort_reason": report.abort_reason,
    })
}
