//! buildwarden: dependency-aware parallel build execution with self-healing
//! retries and a ledgered authorization gate.
//!
//! - [`parallel`] resolves agent dependencies into waves and runs them under
//!   bounded concurrency with timeouts, retries and circuit breakers.
//! - [`healing`] classifies failures and picks a remediation.
//! - [`ledger`] is the append-only, per-build event log.
//! - [`authority`] authorizes lifecycle actions and tracks build trust.
//! - [`orchestrator`] ties them together for one build session.

pub mod authority;
pub mod config;
pub mod healing;
pub mod ledger;
pub mod metrics;
pub mod observe;
pub mod orchestrator;
pub mod parallel;
pub mod resilience;
pub mod timeout;

pub use authority::{AuthorityConfig, AuthorityEngine, AuthorityError, AuthorizationOutcome, AuthorizationRequest, Role};
pub use config::{ConfigError, EngineConfig};
pub use healing::{FailureKind, SelfHealingEngine};
pub use ledger::{AuthorityLedger, LedgerConfig, LedgerEntry, LedgerError, LedgerEventType};
pub use orchestrator::{BuildOrchestrator, BuildOutcome, BuildRun, OrchestratorError};
pub use parallel::{
    AgentExecutor, AgentNode, DependencyGraphBuilder, ExecutionGraph, ExecutionReport, ExecutorConfig,
    ParallelExecutor,
};
