//! Classification-driven remediation of failed task attempts.

pub mod classify;
pub mod engine;
pub mod strategies;

pub use classify::{FailureClassifier, FailureKind};
pub use engine::{
    AttemptFailure, FailedAttempt, FailureRecord, HealedRun, HealingConfig, HealingDecision, HealingError,
    HealingStats, SelfHealingEngine, StrategyStats,
};
pub use strategies::{FailureContext, Recover, RecoveryOutcome, Strategy};
