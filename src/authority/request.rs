//! Authorization requests and their two possible resolutions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::authority::rules::{ActionType, Role};

/// A request to perform a lifecycle action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Unique request id (ULID).
    pub id: String,
    pub build_id: String,
    /// Raw action name. Parsed into an [`ActionType`] by the engine.
    pub action: String,
    pub actor_id: String,
    pub role: Role,
    /// Free-form context, e.g. `estimated_cost` or `justification`.
    pub context: Value,
    pub requested_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    pub fn new(build_id: impl Into<String>, action: impl Into<String>, actor_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: Ulid::new().to_string(),
            build_id: build_id.into(),
            action: action.into(),
            actor_id: actor_id.into(),
            role,
            context: Value::Object(Default::default()),
            requested_at: Utc::now(),
        }
    }

    pub fn for_action(build_id: impl Into<String>, action: ActionType, actor_id: impl Into<String>, role: Role) -> Self {
        Self::new(build_id, action.as_str(), actor_id, role)
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// A condition attached to a granted authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Constraint {
    RequiresChecklist,
    RequiresConfirmation,
    CostCapped { max_cost: f64 },
    TimeBoxed { expires_at: DateTime<Utc> },
    /// Present on every grant.
    Audited,
}

impl Constraint {
    pub fn label(&self) -> String {
        match self {
            Constraint::RequiresChecklist => "requires checklist".to_string(),
            Constraint::RequiresConfirmation => "requires confirmation".to_string(),
            Constraint::CostCapped { max_cost } => format!("cost-capped at {max_cost:.2}"),
            Constraint::TimeBoxed { expires_at } => format!("time-boxed until {}", expires_at.to_rfc3339()),
            Constraint::Audited => "audited".to_string(),
        }
    }
}

/// Machine-checkable reason for a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    RoleNotAllowed,
    TrustCompromised,
    CostExceeded,
    PredicateFailed,
}

/// One reason a request was denied, with a suggested remedy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
    pub remedy: String,
}

impl Violation {
    pub fn new(code: ViolationCode, message: impl Into<String>, remedy: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            remedy: remedy.into(),
        }
    }
}

/// A granted authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub request_id: String,
    pub build_id: String,
    pub action: ActionType,
    pub actor_id: String,
    pub role: Role,
    pub constraints: Vec<Constraint>,
    /// `None` means the grant does not expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
    /// Hash of the tamper-evident chain entry, when the chain accepted it.
    pub chain_hash: Option<String>,
    pub ledger_sequence: u64,
}

impl AuthorizationGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// A denied authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationDenial {
    pub request_id: String,
    pub build_id: String,
    pub action: ActionType,
    pub actor_id: String,
    pub role: Role,
    pub violations: Vec<Violation>,
    pub remedies: Vec<String>,
    pub denied_at: DateTime<Utc>,
    pub ledger_sequence: u64,
}

impl AuthorizationDenial {
    /// Violation messages joined for display.
    pub fn reason(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Every request resolves to exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuthorizationOutcome {
    Granted(AuthorizationGrant),
    Denied(AuthorizationDenial),
}

impl AuthorizationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthorizationOutcome::Granted(_))
    }

    pub fn request_id(&self) -> &str {
        match self {
            AuthorizationOutcome::Granted(grant) => &grant.request_id,
            AuthorizationOutcome::Denied(denial) => &denial.request_id,
        }
    }

    pub fn grant(&self) -> Option<&AuthorizationGrant> {
        match self {
            AuthorizationOutcome::Granted(grant) => Some(grant),
            AuthorizationOutcome::Denied(_) => None,
        }
    }

    pub fn denial(&self) -> Option<&AuthorizationDenial> {
        match self {
            AuthorizationOutcome::Granted(_) => None,
            AuthorizationOutcome::Denied(denial) => Some(denial),
        }
    }
}
