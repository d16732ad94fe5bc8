//! Dependency-aware parallel execution.

pub mod agent;
pub mod dependency;
pub mod scheduler;
pub mod semaphore;

pub use agent::{
    AgentError, AgentExecutor, AgentOutput, DryRunExecutor, ExecutionContext, FnExecutor, Simulation,
    SIMULATE_KEY,
};
pub use dependency::{AgentNode, DependencyGraphBuilder, ExecutionGraph, GraphError, ParallelGroup};
pub use scheduler::{
    ExecutionReport, ExecutionResult, ExecutorConfig, ExecutorControl, ExecutorError, ExecutorState,
    FailureCause, GroupReport, ParallelExecutor, RunStatus, TaskFailure,
};
pub use semaphore::{SemaphoreClosed, TaskPermit, TaskSemaphore};
