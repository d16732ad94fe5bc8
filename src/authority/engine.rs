//! Rule-driven authorization of lifecycle actions, trust scoring and the
//! decision audit trail.
//!
//! Every effect is ledgered first: grants and denials are written before
//! they are returned, trust factors before they are applied, and decisions
//! before they are stored.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::authority::chain::{ChainError, TamperEvidentLog};
use crate::authority::decision::{DecisionQuery, DecisionRecord, DecisionType};
use crate::authority::request::{
    AuthorizationDenial, AuthorizationGrant, AuthorizationOutcome, AuthorizationRequest, Constraint, Violation,
    ViolationCode,
};
use crate::authority::rules::{ActionType, AuthorityRule, RuleTable};
use crate::authority::trust::{TrustBand, TrustLevel};
use crate::ledger::{AuthorityLedger, LedgerError};
use crate::observe::{Observers, Subscriber};
use crate::resilience::{CircuitBreakerConfig, Resilience, RetryPolicy};

/// Resource name used for the tamper-evident log's breaker.
pub const CHAIN_RESOURCE: &str = "chain";

pub const DENIAL_FACTOR: &str = "authorization_denied";
pub const EXECUTION_FAILURE_FACTOR: &str = "execution_failure";
pub const RESTORATION_FACTOR: &str = "verified_restoration";

#[derive(Error, Debug)]
pub enum AuthorityError {
    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("build {0} is not open")]
    UnknownBuild(String),

    #[error("no authorization {request_id} for build {build_id}")]
    UnknownAuthorization { build_id: String, request_id: String },

    #[error("authorization {request_id} was denied")]
    NotGranted { request_id: String },

    #[error("authorization {request_id} expired at {expired_at}")]
    Expired {
        request_id: String,
        expired_at: chrono::DateTime<Utc>,
    },

    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("tamper-evident log error: {0}")]
    Chain(#[from] ChainError),

    #[error("chain verification failed for build {build_id}: {reason}")]
    ChainIntegrity { build_id: String, reason: String },

    #[error("{action} failed: {message}")]
    ActionFailed { action: ActionType, message: String },
}

/// Configuration for the authority engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Trust removed per denied request.
    /// Default: 5
    pub denial_penalty: i32,
    /// Trust removed when an authorized action fails.
    /// Default: 10
    pub execution_failure_penalty: i32,
    /// Trust returned by a verified restoration.
    /// Default: 20
    pub restore_amount: i32,
    /// Retries for chain appends.
    /// Default: 2
    pub chain_retries: u32,
    /// Base delay between chain append retries.
    /// Default: 50ms
    #[serde(rename = "chain_retry_delay_ms", with = "crate::config::duration_ms")]
    pub chain_retry_delay: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            denial_penalty: 5,
            execution_failure_penalty: 10,
            restore_amount: 20,
            chain_retries: 2,
            chain_retry_delay: Duration::from_millis(50),
        }
    }
}

impl AuthorityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_penalties(mut self, denial: i32, execution_failure: i32) -> Self {
        self.denial_penalty = denial;
        self.execution_failure_penalty = execution_failure;
        self
    }

    pub fn with_restore_amount(mut self, amount: i32) -> Self {
        self.restore_amount = amount;
        self
    }

    pub fn with_chain_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.chain_retries = retries;
        self.chain_retry_delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct BuildAuthority {
    trust: TrustLevel,
    grants: HashMap<String, AuthorizationGrant>,
    denials: HashMap<String, AuthorizationDenial>,
    decisions: Vec<DecisionRecord>,
}

/// Registry of per-build authority state plus the policy applied to it.
pub struct AuthorityEngine {
    config: AuthorityConfig,
    rules: RuleTable,
    ledger: Arc<AuthorityLedger>,
    chain: Option<Arc<dyn TamperEvidentLog>>,
    resilience: Resilience,
    builds: Mutex<HashMap<String, BuildAuthority>>,
    decisions: Observers<DecisionRecord>,
}

impl std::fmt::Debug for AuthorityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityEngine")
            .field("config", &self.config)
            .field("rules", &self.rules.len())
            .field("chain", &self.chain.is_some())
            .finish_non_exhaustive()
    }
}

impl AuthorityEngine {
    pub fn new(ledger: Arc<AuthorityLedger>, config: AuthorityConfig) -> Self {
        let resilience = Resilience::new(
            RetryPolicy::new()
                .with_max_retries(config.chain_retries)
                .with_base_delay(config.chain_retry_delay),
            CircuitBreakerConfig::default(),
        );
        Self {
            config,
            rules: RuleTable::defaults(),
            ledger,
            chain: None,
            resilience,
            builds: Mutex::new(HashMap::new()),
            decisions: Observers::new("decisions"),
        }
    }

    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = rules;
        self
    }

    /// Add or replace a single rule.
    pub fn with_rule(mut self, rule: AuthorityRule) -> Self {
        self.rules.insert(rule);
        self
    }

    pub fn with_chain(mut self, chain: Arc<dyn TamperEvidentLog>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<AuthorityLedger> {
        &self.ledger
    }

    pub fn subscribe_decisions(&self) -> broadcast::Receiver<DecisionRecord> {
        self.decisions.subscribe()
    }

    pub fn add_decision_subscriber(&self, subscriber: Arc<dyn Subscriber<DecisionRecord>>) {
        self.decisions.add_subscriber(subscriber);
    }

    fn builds(&self) -> MutexGuard<'_, HashMap<String, BuildAuthority>> {
        self.builds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Build registry
    // ========================================================================

    /// Create authority state for `build_id`. Opening an open build is a no-op.
    pub fn open_build(&self, build_id: &str) -> TrustLevel {
        let mut builds = self.builds();
        builds.entry(build_id.to_string()).or_default().trust.clone()
    }

    /// Dispose of a build's in-memory state, returning its final trust level.
    /// Ledger entries are kept.
    pub fn close_build(&self, build_id: &str) -> Result<TrustLevel, AuthorityError> {
        let state = self
            .builds()
            .remove(build_id)
            .ok_or_else(|| AuthorityError::UnknownBuild(build_id.to_string()))?;
        self.ledger.release_build(build_id);
        Ok(state.trust)
    }

    pub fn is_open(&self, build_id: &str) -> bool {
        self.builds().contains_key(build_id)
    }

    pub fn trust(&self, build_id: &str) -> Result<TrustLevel, AuthorityError> {
        self.builds()
            .get(build_id)
            .map(|state| state.trust.clone())
            .ok_or_else(|| AuthorityError::UnknownBuild(build_id.to_string()))
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Decide `request`.
    ///
    /// Denials are returned as [`AuthorizationOutcome::Denied`]. Unknown
    /// actions, unknown builds and ledger failures are errors.
    pub async fn request_authorization(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationOutcome, AuthorityError> {
        let build_id = request.build_id.clone();
        let band = self.trust(&build_id)?.band();

        let rule = match request.action.parse::<ActionType>() {
            Ok(action) => self.rules.get(action),
            Err(_) => None,
        };
        let Some(rule) = rule else {
            let message = format!("unknown action type: {}", request.action);
            self.ledger.error(&build_id, "authority", &message)?;
            warn!(build_id = %build_id, action = %request.action, actor = %request.actor_id, "unknown action requested");
            return Err(AuthorityError::UnknownAction(request.action));
        };

        if let Some(violation) = self.evaluate(rule, &request, band) {
            return self.deny(request, rule.action, violation).map(AuthorizationOutcome::Denied);
        }
        self.grant(request, rule).await.map(AuthorizationOutcome::Granted)
    }

    /// First failing check, in order: role, trust band, custom predicate.
    fn evaluate(&self, rule: &AuthorityRule, request: &AuthorizationRequest, band: TrustBand) -> Option<Violation> {
        if !rule.allows(request.role) {
            return Some(Violation::new(
                ViolationCode::RoleNotAllowed,
                format!(
                    "Role '{}' is not permitted to perform {} (allowed: {})",
                    request.role,
                    rule.action,
                    rule.allowed_roles_label()
                ),
                format!(
                    "Ask an actor with one of these roles to request {}: {}",
                    rule.action,
                    rule.allowed_roles_label()
                ),
            ));
        }
        if band == TrustBand::Compromised {
            return Some(Violation::new(
                ViolationCode::TrustCompromised,
                format!("Build {} is compromised; no actions are authorized", request.build_id),
                "Verify the build's audit chain and restore trust before retrying",
            ));
        }
        rule.predicate.as_ref().and_then(|predicate| predicate(request).err())
    }

    fn deny(
        &self,
        request: AuthorizationRequest,
        action: ActionType,
        violation: Violation,
    ) -> Result<AuthorizationDenial, AuthorityError> {
        let build_id = request.build_id.clone();
        let mut denial = AuthorizationDenial {
            request_id: request.id.clone(),
            build_id: build_id.clone(),
            action,
            actor_id: request.actor_id.clone(),
            role: request.role,
            remedies: vec![violation.remedy.clone()],
            violations: vec![violation],
            denied_at: Utc::now(),
            ledger_sequence: 0,
        };

        let entry = self.ledger.authorization_denied(
            &build_id,
            &request.actor_id,
            json!({
                "request_id": request.id,
                "action": action,
                "role": request.role,
                "violations": denial.violations,
                "remedies": denial.remedies,
                "context": request.context,
            }),
        )?;
        denial.ledger_sequence = entry.sequence;
        warn!(
            build_id = %build_id,
            action = %action,
            actor = %request.actor_id,
            role = %request.role,
            reason = %denial.reason(),
            "authorization denied"
        );

        {
            let mut builds = self.builds();
            let state = builds
                .get_mut(&build_id)
                .ok_or_else(|| AuthorityError::UnknownBuild(build_id.clone()))?;
            state.denials.insert(denial.request_id.clone(), denial.clone());
            let decision = DecisionRecord::new(&build_id, DecisionType::Authorization, action.as_str(), "denied")
                .with_actor(&request.actor_id)
                .with_reasoning(denial.violations.iter().map(|v| v.message.clone()));
            state.decisions.push(DecisionRecord {
                ledger_sequence: Some(entry.sequence),
                ..decision
            });
        }

        self.adjust_trust(
            &build_id,
            DENIAL_FACTOR,
            -self.config.denial_penalty,
            "authorization denied",
        )?;
        Ok(denial)
    }

    async fn grant(
        &self,
        request: AuthorizationRequest,
        rule: &AuthorityRule,
    ) -> Result<AuthorizationGrant, AuthorityError> {
        let build_id = request.build_id.clone();
        let granted_at = Utc::now();
        let expires_at = rule
            .time_limit
            .and_then(|limit| chrono::Duration::from_std(limit).ok())
            .and_then(|limit| granted_at.checked_add_signed(limit));

        let mut constraints = Vec::new();
        if rule.requires_checklist {
            constraints.push(Constraint::RequiresChecklist);
        }
        if rule.requires_confirmation {
            constraints.push(Constraint::RequiresConfirmation);
        }
        if let Some(expires_at) = expires_at {
            constraints.push(Constraint::TimeBoxed { expires_at });
        }
        if let Some(max_cost) = rule.max_cost {
            constraints.push(Constraint::CostCapped { max_cost });
        }
        constraints.push(Constraint::Audited);

        let details = json!({
            "request_id": request.id,
            "action": rule.action,
            "role": request.role,
            "constraints": constraints,
            "expires_at": expires_at,
            "context": request.context,
        });
        let entry = self
            .ledger
            .authorization_granted(&build_id, &request.actor_id, details.clone())?;
        let chain_hash = self
            .append_to_chain(&build_id, "authorization_granted", &details)
            .await;

        let grant = AuthorizationGrant {
            request_id: request.id.clone(),
            build_id: build_id.clone(),
            action: rule.action,
            actor_id: request.actor_id.clone(),
            role: request.role,
            constraints,
            expires_at,
            granted_at,
            chain_hash: chain_hash.clone(),
            ledger_sequence: entry.sequence,
        };

        {
            let mut builds = self.builds();
            let state = builds
                .get_mut(&build_id)
                .ok_or_else(|| AuthorityError::UnknownBuild(build_id.clone()))?;
            state.grants.insert(grant.request_id.clone(), grant.clone());
            state.decisions.push(DecisionRecord {
                ledger_sequence: Some(entry.sequence),
                chain_hash,
                ..DecisionRecord::new(&build_id, DecisionType::Authorization, rule.action.as_str(), "granted")
                    .with_actor(&request.actor_id)
                    .with_constraints(grant.constraints.iter().map(Constraint::label))
            });
        }

        info!(
            build_id = %build_id,
            action = %rule.action,
            actor = %request.actor_id,
            request_id = %grant.request_id,
            "authorization granted"
        );
        Ok(grant)
    }

    /// Confirm a grant exists and has not expired.
    pub fn verify_authorization(&self, build_id: &str, request_id: &str) -> Result<AuthorizationGrant, AuthorityError> {
        let builds = self.builds();
        let state = builds
            .get(build_id)
            .ok_or_else(|| AuthorityError::UnknownBuild(build_id.to_string()))?;

        let Some(grant) = state.grants.get(request_id) else {
            if state.denials.contains_key(request_id) {
                return Err(AuthorityError::NotGranted {
                    request_id: request_id.to_string(),
                });
            }
            return Err(AuthorityError::UnknownAuthorization {
                build_id: build_id.to_string(),
                request_id: request_id.to_string(),
            });
        };

        if grant.is_expired_at(Utc::now()) {
            return Err(AuthorityError::Expired {
                request_id: request_id.to_string(),
                expired_at: grant.expires_at.unwrap_or(grant.granted_at),
            });
        }
        Ok(grant.clone())
    }

    /// Re-verify a grant, then run `action`.
    ///
    /// Both outcomes are ledgered and chained. A failure also costs the
    /// build `execution_failure_penalty` trust.
    pub async fn execute_authorized<F, Fut, T, E>(
        &self,
        build_id: &str,
        request_id: &str,
        action: F,
    ) -> Result<T, AuthorityError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let grant = self.verify_authorization(build_id, request_id)?;

        match action().await {
            Ok(value) => {
                let details = json!({
                    "request_id": request_id,
                    "action": grant.action,
                    "outcome": "success",
                });
                self.ledger.action_executed(build_id, &grant.actor_id, details.clone())?;
                self.append_to_chain(build_id, "action_executed", &details).await;
                info!(build_id, action = %grant.action, request_id, "authorized action succeeded");
                Ok(value)
            }
            Err(err) => {
                let message = err.to_string();
                let details = json!({
                    "request_id": request_id,
                    "action": grant.action,
                    "outcome": "failure",
                    "error": message,
                });
                self.ledger.action_executed(build_id, &grant.actor_id, details.clone())?;
                self.append_to_chain(build_id, "action_failed", &details).await;
                warn!(build_id, action = %grant.action, request_id, error = %message, "authorized action failed");
                self.adjust_trust(
                    build_id,
                    EXECUTION_FAILURE_FACTOR,
                    -self.config.execution_failure_penalty,
                    "execution failure",
                )?;
                Err(AuthorityError::ActionFailed {
                    action: grant.action,
                    message,
                })
            }
        }
    }

    // ========================================================================
    // Trust
    // ========================================================================

    /// Lower a build's trust by `amount` under the factor `name`.
    pub fn degrade_trust(&self, build_id: &str, name: &str, amount: i32, reason: &str) -> Result<TrustLevel, AuthorityError> {
        self.adjust_trust(build_id, name, -amount.abs(), reason)
    }

    /// Raise trust by `restore_amount` after the chain verifies.
    ///
    /// Fails without changing the score when no chain is attached, the
    /// chain cannot be read, or verification reports a break.
    pub async fn restore_trust(&self, build_id: &str, reason: &str) -> Result<TrustLevel, AuthorityError> {
        self.trust(build_id)?;
        let chain = self.chain.as_ref().ok_or_else(|| AuthorityError::ChainIntegrity {
            build_id: build_id.to_string(),
            reason: "no tamper-evident log attached".to_string(),
        })?;

        let verification = chain.verify_chain(build_id).await?;
        if !verification.valid {
            let reason = match verification.broken_at_sequence {
                Some(sequence) => format!("chain broken at sequence {sequence}"),
                None => "chain reported invalid".to_string(),
            };
            self.ledger.error(build_id, "authority", &reason)?;
            warn!(build_id, reason = %reason, "trust restoration refused");
            return Err(AuthorityError::ChainIntegrity {
                build_id: build_id.to_string(),
                reason,
            });
        }

        self.adjust_trust(build_id, RESTORATION_FACTOR, self.config.restore_amount.abs(), reason)
    }

    /// Ledger a trust factor, then apply it.
    fn adjust_trust(&self, build_id: &str, name: &str, impact: i32, reason: &str) -> Result<TrustLevel, AuthorityError> {
        let mut builds = self.builds();
        let state = builds
            .get_mut(build_id)
            .ok_or_else(|| AuthorityError::UnknownBuild(build_id.to_string()))?;

        let factor = state.trust.preview(name, impact, reason);
        let band_before = state.trust.band();
        self.ledger.trust_changed(build_id, json!(factor))?;
        state.trust.apply(factor);

        let band = state.trust.band();
        info!(
            build_id,
            factor = name,
            impact,
            score = state.trust.score(),
            band = %band,
            "trust changed"
        );
        if band != band_before {
            warn!(build_id, from = %band_before, to = %band, "trust band changed");
        }
        Ok(state.trust.clone())
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    /// Ledger, chain and store a reasoned decision.
    pub async fn record_decision(&self, decision: DecisionRecord) -> Result<DecisionRecord, AuthorityError> {
        let build_id = decision.build_id.clone();
        self.trust(&build_id)?;

        let details = json!({
            "decision_id": decision.id,
            "decision_type": decision.decision_type,
            "action": decision.action,
            "decision": decision.decision,
            "reasoning": decision.reasoning,
            "constraints": decision.constraints,
            "alternatives_rejected": decision.alternatives_rejected,
        });
        let entry = self
            .ledger
            .decision_recorded(&build_id, decision.actor_id.as_deref(), details.clone())?;
        let chain_hash = self.append_to_chain(&build_id, "decision_recorded", &details).await;

        let record = DecisionRecord {
            ledger_sequence: Some(entry.sequence),
            chain_hash,
            ..decision
        };
        {
            let mut builds = self.builds();
            let state = builds
                .get_mut(&build_id)
                .ok_or_else(|| AuthorityError::UnknownBuild(build_id.clone()))?;
            state.decisions.push(record.clone());
        }
        self.decisions.publish(&record);
        Ok(record)
    }

    /// Decisions for `build_id` matching `query`, oldest first.
    pub fn query_decisions(&self, build_id: &str, query: &DecisionQuery) -> Result<Vec<DecisionRecord>, AuthorityError> {
        let builds = self.builds();
        let state = builds
            .get(build_id)
            .ok_or_else(|| AuthorityError::UnknownBuild(build_id.to_string()))?;
        Ok(query.apply(&state.decisions).into_iter().cloned().collect())
    }

    /// Append to the chain through the retry policy and breaker.
    /// Failures are logged and yield `None`.
    async fn append_to_chain(&self, build_id: &str, event_type: &str, payload: &Value) -> Option<String> {
        let chain = self.chain.as_ref()?;
        let result = self
            .resilience
            .call(CHAIN_RESOURCE, |_| chain.append_to_chain(build_id, event_type, payload))
            .await;
        match result {
            Ok(receipt) => Some(receipt.value.hash),
            Err(err) => {
                warn!(build_id, event_type, error = %err, "chain append failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::chain::{ChainReceipt, ChainVerification, MemoryHashChain};
    use crate::authority::rules::Role;
    use crate::ledger::LedgerEventType;
    use async_trait::async_trait;

    struct UnavailableChain;

    #[async_trait]
    impl TamperEvidentLog for UnavailableChain {
        async fn append_to_chain(&self, _: &str, _: &str, _: &Value) -> Result<ChainReceipt, ChainError> {
            Err(ChainError::Unavailable("connection refused".to_string()))
        }

        async fn verify_chain(&self, _: &str) -> Result<ChainVerification, ChainError> {
            Err(ChainError::Unavailable("connection refused".to_string()))
        }
    }

    fn fast_config() -> AuthorityConfig {
        AuthorityConfig::new().with_chain_retries(1, Duration::from_millis(1))
    }

    fn engine() -> (AuthorityEngine, Arc<MemoryHashChain>) {
        let chain = Arc::new(MemoryHashChain::new());
        let engine = AuthorityEngine::new(Arc::new(AuthorityLedger::in_memory()), fast_config())
            .with_chain(chain.clone());
        engine.open_build("b");
        (engine, chain)
    }

    fn request(action: &str, role: Role) -> AuthorizationRequest {
        AuthorizationRequest::new("b", action, "alice", role)
    }

    // ========================================================================
    // request_authorization
    // ========================================================================

    #[tokio::test]
    async fn test_observer_cannot_pause_and_denial_is_ledgered() {
        let (engine, _) = engine();

        let outcome = engine
            .request_authorization(request("BUILD_PAUSE", Role::Observer))
            .await
            .expect("outcome");

        let denial = outcome.denial().expect("denied");
        assert_eq!(denial.violations[0].code, ViolationCode::RoleNotAllowed);
        assert_eq!(
            denial.violations[0].message,
            "Role 'observer' is not permitted to perform build_pause (allowed: owner, operator, system)"
        );
        assert!(!denial.remedies.is_empty());

        let ledger = engine.ledger().read_build_ledger("b").expect("read");
        assert!(ledger
            .iter()
            .any(|e| e.event_type == LedgerEventType::AuthorizationDenied
                && e.details["request_id"] == json!(denial.request_id)));
        assert_eq!(engine.trust("b").expect("trust").score(), 95);
    }

    #[tokio::test]
    async fn test_operator_pause_is_granted_with_audit_constraint_and_chain_hash() {
        let (engine, chain) = engine();

        let outcome = engine
            .request_authorization(request("build_pause", Role::Operator))
            .await
            .expect("outcome");

        let grant = outcome.grant().expect("granted");
        assert_eq!(grant.action, ActionType::BuildPause);
        assert_eq!(grant.constraints, vec![Constraint::Audited]);
        assert_eq!(grant.expires_at, None);
        assert_eq!(grant.chain_hash, chain.links("b").first().map(|l| l.hash.clone()));
        assert!(engine.verify_authorization("b", &grant.request_id).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_action_is_an_error_and_ledgered() {
        let (engine, _) = engine();

        let err = engine
            .request_authorization(request("launch_rocket", Role::Owner))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorityError::UnknownAction(ref a) if a == "launch_rocket"));
        let ledger = engine.ledger().read_build_ledger("b").expect("read");
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].event_type, LedgerEventType::Error);
        assert_eq!(engine.trust("b").expect("trust").score(), 100);
    }

    #[tokio::test]
    async fn test_unopened_build_is_rejected() {
        let (engine, _) = engine();
        let err = engine
            .request_authorization(AuthorizationRequest::new("other", "build_start", "a", Role::Owner))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::UnknownBuild(_)));
    }

    #[tokio::test]
    async fn test_three_denials_leave_build_trusted_at_85() {
        let (engine, _) = engine();
        for _ in 0..3 {
            let outcome = engine
                .request_authorization(request("build_cancel", Role::Reviewer))
                .await
                .expect("outcome");
            assert!(!outcome.is_granted());
        }

        let trust = engine.trust("b").expect("trust");
        assert_eq!(trust.score(), 85);
        assert_eq!(trust.band(), TrustBand::Trusted);
        assert!(trust.factors().iter().all(|f| f.reason == "authorization denied"));
    }

    #[tokio::test]
    async fn test_compromised_build_denies_even_allowed_roles() {
        let (engine, _) = engine();
        engine.degrade_trust("b", "manual", 85, "operator flagged").expect("degrade");

        let outcome = engine
            .request_authorization(request("build_start", Role::Owner))
            .await
            .expect("outcome");

        assert_eq!(
            outcome.denial().expect("denied").violations[0].code,
            ViolationCode::TrustCompromised
        );
    }

    #[tokio::test]
    async fn test_predicate_violation_denies() {
        let (engine, _) = engine();

        let outcome = engine
            .request_authorization(
                request("agent_retry", Role::Operator).with_context(json!({ "estimated_cost": 80.0 })),
            )
            .await
            .expect("outcome");

        assert_eq!(
            outcome.denial().expect("denied").violations[0].code,
            ViolationCode::CostExceeded
        );
    }

    #[tokio::test]
    async fn test_time_boxed_grant_expires() {
        let ledger = Arc::new(AuthorityLedger::in_memory());
        let engine = AuthorityEngine::new(ledger, fast_config()).with_rule(
            AuthorityRule::new(ActionType::PhaseSkip, [Role::Owner]).with_time_limit(Duration::from_millis(5)),
        );
        engine.open_build("b");

        let outcome = engine
            .request_authorization(request("phase_skip", Role::Owner))
            .await
            .expect("outcome");
        let grant = outcome.grant().expect("granted");
        assert!(matches!(grant.constraints[0], Constraint::TimeBoxed { .. }));
        assert_eq!(grant.chain_hash, None);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = engine.verify_authorization("b", &grant.request_id).unwrap_err();
        assert!(matches!(err, AuthorityError::Expired { .. }));
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_and_denied_requests() {
        let (engine, _) = engine();
        let denied = engine
            .request_authorization(request("build_pause", Role::Observer))
            .await
            .expect("outcome");

        assert!(matches!(
            engine.verify_authorization("b", "nope"),
            Err(AuthorityError::UnknownAuthorization { .. })
        ));
        assert!(matches!(
            engine.verify_authorization("b", denied.request_id()),
            Err(AuthorityError::NotGranted { .. })
        ));
    }

    #[tokio::test]
    async fn test_chain_failure_does_not_block_grant() {
        let engine = AuthorityEngine::new(Arc::new(AuthorityLedger::in_memory()), fast_config())
            .with_chain(Arc::new(UnavailableChain));
        engine.open_build("b");

        let outcome = engine
            .request_authorization(request("build_start", Role::Owner))
            .await
            .expect("outcome");

        let grant = outcome.grant().expect("granted");
        assert_eq!(grant.chain_hash, None);
        assert!(grant.constraints.contains(&Constraint::RequiresChecklist));
    }

    // ========================================================================
    // execute_authorized
    // ========================================================================

    #[tokio::test]
    async fn test_execute_authorized_runs_action_and_records_outcome() {
        let (engine, chain) = engine();
        let outcome = engine
            .request_authorization(request("build_resume", Role::Owner))
            .await
            .expect("outcome");

        let value = engine
            .execute_authorized("b", outcome.request_id(), || async { Ok::<_, String>(42) })
            .await
            .expect("executed");

        assert_eq!(value, 42);
        assert_eq!(chain.links("b").len(), 2);
        let ledger = engine.ledger().read_build_ledger("b").expect("read");
        assert_eq!(ledger.last().expect("entry").event_type, LedgerEventType::ActionExecuted);
    }

    #[tokio::test]
    async fn test_failed_action_degrades_trust_by_ten() {
        let (engine, _) = engine();
        let outcome = engine
            .request_authorization(request("build_start", Role::Owner))
            .await
            .expect("outcome");

        let err = engine
            .execute_authorized("b", outcome.request_id(), || async { Err::<(), _>("disk full") })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorityError::ActionFailed { action: ActionType::BuildStart, .. }));
        let trust = engine.trust("b").expect("trust");
        assert_eq!(trust.score(), 90);
        assert_eq!(trust.factors()[0].reason, "execution failure");
    }

    #[tokio::test]
    async fn test_execute_without_grant_never_runs_action() {
        let (engine, _) = engine();
        let mut ran = false;

        let result = engine
            .execute_authorized("b", "missing", || {
                ran = true;
                async { Ok::<_, String>(()) }
            })
            .await;

        assert!(result.is_err());
        assert!(!ran);
    }

    // ========================================================================
    // Trust restoration
    // ========================================================================

    #[tokio::test]
    async fn test_restore_requires_valid_chain() {
        let (engine, chain) = engine();
        engine.degrade_trust("b", "manual", 60, "incident").expect("degrade");
        engine
            .request_authorization(request("build_pause", Role::Operator))
            .await
            .expect("outcome");

        let restored = engine.restore_trust("b", "audit passed").await.expect("restore");
        assert_eq!(restored.score(), 60);

        chain.tamper("b", 1, "{}");
        let err = engine.restore_trust("b", "audit passed").await.unwrap_err();
        assert!(matches!(err, AuthorityError::ChainIntegrity { .. }));
        assert_eq!(engine.trust("b").expect("trust").score(), 60);
    }

    #[tokio::test]
    async fn test_restore_without_chain_fails() {
        let engine = AuthorityEngine::new(Arc::new(AuthorityLedger::in_memory()), fast_config());
        engine.open_build("b");

        let err = engine.restore_trust("b", "audit").await.unwrap_err();
        assert!(matches!(err, AuthorityError::ChainIntegrity { .. }));
    }

    #[tokio::test]
    async fn test_trust_changes_are_ledgered() {
        let (engine, _) = engine();
        engine.degrade_trust("b", "manual", 10, "flaky gate").expect("degrade");

        let ledger = engine.ledger().read_build_ledger("b").expect("read");
        let entry = ledger.last().expect("entry");
        assert_eq!(entry.event_type, LedgerEventType::TrustChanged);
        assert_eq!(entry.details["score_after"], json!(90));
        assert_eq!(entry.details["name"], json!("manual"));
    }

    // ========================================================================
    // Decisions and registry
    // ========================================================================

    #[tokio::test]
    async fn test_record_and_query_decisions() {
        let (engine, _) = engine();
        let mut rx = engine.subscribe_decisions();

        let record = engine
            .record_decision(
                DecisionRecord::new("b", DecisionType::GateResolution, "gate_approve", "approved")
                    .with_actor("bob")
                    .with_reasoning(["all checks green"])
                    .with_alternatives(["hold for manual QA"]),
            )
            .await
            .expect("record");

        assert!(record.ledger_sequence.is_some());
        assert!(record.chain_hash.is_some());
        assert_eq!(rx.try_recv().expect("published").id, record.id);

        let by_actor = engine
            .query_decisions("b", &DecisionQuery::new().by_actor("bob"))
            .expect("query");
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].alternatives_rejected, vec!["hold for manual QA"]);
    }

    #[tokio::test]
    async fn test_authorizations_appear_in_decision_trail() {
        let (engine, _) = engine();
        engine
            .request_authorization(request("build_pause", Role::Observer))
            .await
            .expect("outcome");

        let decisions = engine
            .query_decisions("b", &DecisionQuery::new().of_type(DecisionType::Authorization))
            .expect("query");

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].decision, "denied");
    }

    #[test]
    fn test_close_build_disposes_state() {
        let (engine, _) = engine();
        assert!(engine.is_open("b"));

        let trust = engine.close_build("b").expect("close");

        assert_eq!(trust.score(), 100);
        assert!(!engine.is_open("b"));
        assert!(matches!(engine.close_build("b"), Err(AuthorityError::UnknownBuild(_))));
        assert!(matches!(engine.trust("b"), Err(AuthorityError::UnknownBuild(_))));
    }
}
