//! Lifecycle actions, actor roles and the rule attached to each action.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authority::request::{AuthorizationRequest, Violation, ViolationCode};

/// Lifecycle actions that require authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    BuildStart,
    BuildPause,
    BuildResume,
    BuildCancel,
    GateApprove,
    GateReject,
    AgentRetry,
    PhaseSkip,
    CostOverride,
}

impl ActionType {
    pub const ALL: [ActionType; 9] = [
        ActionType::BuildStart,
        ActionType::BuildPause,
        ActionType::BuildResume,
        ActionType::BuildCancel,
        ActionType::GateApprove,
        ActionType::GateReject,
        ActionType::AgentRetry,
        ActionType::PhaseSkip,
        ActionType::CostOverride,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::BuildStart => "build_start",
            ActionType::BuildPause => "build_pause",
            ActionType::BuildResume => "build_resume",
            ActionType::BuildCancel => "build_cancel",
            ActionType::GateApprove => "gate_approve",
            ActionType::GateReject => "gate_reject",
            ActionType::AgentRetry => "agent_retry",
            ActionType::PhaseSkip => "phase_skip",
            ActionType::CostOverride => "cost_override",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `build_pause`, `BUILD_PAUSE` and `build-pause`.
impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ActionType::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
            .ok_or_else(|| format!("unknown action type: {s}"))
    }
}

/// Role an actor holds for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Operator,
    Reviewer,
    Observer,
    /// The engine itself.
    System,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Owner,
        Role::Admin,
        Role::Operator,
        Role::Reviewer,
        Role::Observer,
        Role::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Reviewer => "reviewer",
            Role::Observer => "observer",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| format!("unknown role: {s}"))
    }
}

/// Extra check run against a request after role and trust checks pass.
pub type RulePredicate = Arc<dyn Fn(&AuthorizationRequest) -> Result<(), Violation> + Send + Sync>;

/// Static policy for one action type.
#[derive(Clone)]
pub struct AuthorityRule {
    pub action: ActionType,
    pub allowed_roles: Vec<Role>,
    pub requires_checklist: bool,
    pub requires_confirmation: bool,
    pub max_cost: Option<f64>,
    /// Grants for this action expire after this long.
    pub time_limit: Option<Duration>,
    pub predicate: Option<RulePredicate>,
}

impl fmt::Debug for AuthorityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityRule")
            .field("action", &self.action)
            .field("allowed_roles", &self.allowed_roles)
            .field("requires_checklist", &self.requires_checklist)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("max_cost", &self.max_cost)
            .field("time_limit", &self.time_limit)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl AuthorityRule {
    pub fn new(action: ActionType, allowed_roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            action,
            allowed_roles: allowed_roles.into_iter().collect(),
            requires_checklist: false,
            requires_confirmation: false,
            max_cost: None,
            time_limit: None,
            predicate: None,
        }
    }

    pub fn with_checklist(mut self) -> Self {
        self.requires_checklist = true;
        self
    }

    pub fn with_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AuthorizationRequest) -> Result<(), Violation> + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn allows(&self, role: Role) -> bool {
        self.allowed_roles.contains(&role)
    }

    /// Comma-separated allowed roles, e.g. `owner, operator, system`.
    pub fn allowed_roles_label(&self) -> String {
        self.allowed_roles
            .iter()
            .map(Role::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Rejects requests whose `estimated_cost` context exceeds `max_cost`.
pub fn cost_ceiling(max_cost: f64) -> impl Fn(&AuthorizationRequest) -> Result<(), Violation> + Send + Sync {
    move |request| {
        let cost = request
            .context
            .get("estimated_cost")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if cost > max_cost {
            return Err(Violation::new(
                ViolationCode::CostExceeded,
                format!("Estimated cost {cost:.2} exceeds the limit of {max_cost:.2}"),
                "Request a cost_override before retrying",
            ));
        }
        Ok(())
    }
}

/// Rejects requests without a non-empty `justification` in their context.
pub fn requires_justification(request: &AuthorizationRequest) -> Result<(), Violation> {
    let justified = request
        .context
        .get("justification")
        .and_then(Value::as_str)
        .is_some_and(|text| !text.trim().is_empty());
    if justified {
        Ok(())
    } else {
        Err(Violation::new(
            ViolationCode::PredicateFailed,
            format!("{} requires a justification", request.action),
            "Add a `justification` to the request context",
        ))
    }
}

/// The rule for each action type.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: HashMap<ActionType, AuthorityRule>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::defaults()
    }
}

impl RuleTable {
    /// An empty table; every action is unknown until a rule is added.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// The built-in policy.
    pub fn defaults() -> Self {
        use ActionType::*;
        use Role::*;

        Self::empty()
            .with_rule(AuthorityRule::new(BuildStart, [Owner, Admin, Operator, System]).with_checklist())
            .with_rule(AuthorityRule::new(BuildPause, [Owner, Operator, System]))
            .with_rule(AuthorityRule::new(BuildResume, [Owner, Operator, System]))
            .with_rule(AuthorityRule::new(BuildCancel, [Owner, Admin, System]).with_confirmation())
            .with_rule(
                AuthorityRule::new(GateApprove, [Owner, Admin, Reviewer])
                    .with_checklist()
                    .with_time_limit(Duration::from_secs(24 * 60 * 60)),
            )
            .with_rule(AuthorityRule::new(GateReject, [Owner, Admin, Reviewer]))
            .with_rule(
                AuthorityRule::new(AgentRetry, [Owner, Operator, System])
                    .with_max_cost(50.0)
                    .with_predicate(cost_ceiling(50.0)),
            )
            .with_rule(
                AuthorityRule::new(PhaseSkip, [Owner, Admin])
                    .with_confirmation()
                    .with_time_limit(Duration::from_secs(60 * 60)),
            )
            .with_rule(
                AuthorityRule::new(CostOverride, [Owner, Admin])
                    .with_confirmation()
                    .with_predicate(requires_justification),
            )
    }

    /// Add or replace the rule for `rule.action`.
    pub fn with_rule(mut self, rule: AuthorityRule) -> Self {
        self.insert(rule);
        self
    }

    pub fn insert(&mut self, rule: AuthorityRule) {
        self.rules.insert(rule.action, rule);
    }

    pub fn get(&self, action: ActionType) -> Option<&AuthorityRule> {
        self.rules.get(&action)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
