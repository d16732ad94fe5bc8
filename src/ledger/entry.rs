use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Every kind of event the ledger accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    BuildStarted,
    BuildPaused,
    BuildResumed,
    BuildCancelled,
    BuildCompleted,
    BuildFailed,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    AgentStarted,
    AgentCompleted,
    AgentFailed,
    GateOpened,
    GateResolved,
    ArtifactCreated,
    CostUpdated,
    AuthorizationGranted,
    AuthorizationDenied,
    ActionExecuted,
    TrustChanged,
    DecisionRecorded,
    Error,
}

impl LedgerEventType {
    pub const ALL: [LedgerEventType; 22] = [
        LedgerEventType::BuildStarted,
        LedgerEventType::BuildPaused,
        LedgerEventType::BuildResumed,
        LedgerEventType::BuildCancelled,
        LedgerEventType::BuildCompleted,
        LedgerEventType::BuildFailed,
        LedgerEventType::PhaseStarted,
        LedgerEventType::PhaseCompleted,
        LedgerEventType::PhaseFailed,
        LedgerEventType::AgentStarted,
        LedgerEventType::AgentCompleted,
        LedgerEventType::AgentFailed,
        LedgerEventType::GateOpened,
        LedgerEventType::GateResolved,
        LedgerEventType::ArtifactCreated,
        LedgerEventType::CostUpdated,
        LedgerEventType::AuthorizationGranted,
        LedgerEventType::AuthorizationDenied,
        LedgerEventType::ActionExecuted,
        LedgerEventType::TrustChanged,
        LedgerEventType::DecisionRecorded,
        LedgerEventType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventType::BuildStarted => "build_started",
            LedgerEventType::BuildPaused => "build_paused",
            LedgerEventType::BuildResumed => "build_resumed",
            LedgerEventType::BuildCancelled => "build_cancelled",
            LedgerEventType::BuildCompleted => "build_completed",
            LedgerEventType::BuildFailed => "build_failed",
            LedgerEventType::PhaseStarted => "phase_started",
            LedgerEventType::PhaseCompleted => "phase_completed",
            LedgerEventType::PhaseFailed => "phase_failed",
            LedgerEventType::AgentStarted => "agent_started",
            LedgerEventType::AgentCompleted => "agent_completed",
            LedgerEventType::AgentFailed => "agent_failed",
            LedgerEventType::GateOpened => "gate_opened",
            LedgerEventType::GateResolved => "gate_resolved",
            LedgerEventType::ArtifactCreated => "artifact_created",
            LedgerEventType::CostUpdated => "cost_updated",
            LedgerEventType::AuthorizationGranted => "authorization_granted",
            LedgerEventType::AuthorizationDenied => "authorization_denied",
            LedgerEventType::ActionExecuted => "action_executed",
            LedgerEventType::TrustChanged => "trust_changed",
            LedgerEventType::DecisionRecorded => "decision_recorded",
            LedgerEventType::Error => "error",
        }
    }

    /// Events that end a build.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerEventType::BuildCompleted | LedgerEventType::BuildFailed | LedgerEventType::BuildCancelled
        )
    }
}

impl fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LedgerEventType::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("unknown ledger event type: {s}"))
    }
}

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Globally unique ULID.
    pub id: String,
    pub build_id: String,
    pub event_type: LedgerEventType,
    /// `None` for system-originated events.
    pub actor_id: Option<String>,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
    /// Per-build position, contiguous from 1.
    pub sequence: u64,
}

impl LedgerEntry {
    pub(crate) fn new(
        build_id: impl Into<String>,
        event_type: LedgerEventType,
        actor_id: Option<String>,
        details: Value,
        sequence: u64,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            build_id: build_id.into(),
            event_type,
            actor_id,
            details,
            timestamp: Utc::now(),
            sequence,
        }
    }

    /// True for events with no actor.
    pub fn is_system(&self) -> bool {
        self.actor_id.is_none()
    }
}
