//! Authorization of build lifecycle actions.
//!
//! Requests are checked against a [`RuleTable`], every grant and denial is
//! written to the [`AuthorityLedger`](crate::ledger::AuthorityLedger), and
//! each build carries a [`TrustLevel`] that denials and failed actions wear
//! down. Grants and decisions are also appended to an optional
//! [`TamperEvidentLog`].

pub mod chain;
pub mod decision;
pub mod engine;
pub mod request;
pub mod rules;
pub mod trust;

pub use chain::{ChainError, ChainLink, ChainReceipt, ChainVerification, MemoryHashChain, TamperEvidentLog, GENESIS_HASH};
pub use decision::{DecisionQuery, DecisionRecord, DecisionType};
pub use engine::{AuthorityConfig, AuthorityEngine, AuthorityError, CHAIN_RESOURCE};
pub use request::{
    AuthorizationDenial, AuthorizationGrant, AuthorizationOutcome, AuthorizationRequest, Constraint, Violation,
    ViolationCode,
};
pub use rules::{cost_ceiling, requires_justification, ActionType, AuthorityRule, Role, RulePredicate, RuleTable};
pub use trust::{TrustBand, TrustFactor, TrustLevel, MAX_TRUST, MIN_TRUST};
