//! Audit trail of reasoned decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Authorization,
    GateResolution,
    Override,
    SystemAction,
}

/// Immutable record of why something was decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub build_id: String,
    pub decision_type: DecisionType,
    pub actor_id: Option<String>,
    pub action: String,
    /// The outcome, e.g. `granted`, `denied`, `approved`.
    pub decision: String,
    pub reasoning: Vec<String>,
    pub constraints: Vec<String>,
    pub alternatives_rejected: Vec<String>,
    pub ledger_sequence: Option<u64>,
    pub chain_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        build_id: impl Into<String>,
        decision_type: DecisionType,
        action: impl Into<String>,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            build_id: build_id.into(),
            decision_type,
            actor_id: None,
            action: action.into(),
            decision: decision.into(),
            reasoning: Vec::new(),
            constraints: Vec::new(),
            alternatives_rejected: Vec::new(),
            ledger_sequence: None,
            chain_hash: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_reasoning<I, S>(mut self, reasoning: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reasoning.extend(reasoning.into_iter().map(Into::into));
        self
    }

    pub fn with_constraints<I, S>(mut self, constraints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.constraints.extend(constraints.into_iter().map(Into::into));
        self
    }

    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives_rejected
            .extend(alternatives.into_iter().map(Into::into));
        self
    }
}

/// Filter for [`DecisionRecord`]s. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionQuery {
    pub decision_type: Option<DecisionType>,
    pub actor_id: Option<String>,
    pub action: Option<String>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
}

impl DecisionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(mut self, decision_type: DecisionType) -> Self {
        self.decision_type = Some(decision_type);
        self
    }

    pub fn by_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn for_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn between(mut self, since: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self.until = until;
        self
    }

    pub fn matches(&self, record: &DecisionRecord) -> bool {
        self.decision_type.map_or(true, |t| t == record.decision_type)
            && self
                .actor_id
                .as_deref()
                .map_or(true, |actor| record.actor_id.as_deref() == Some(actor))
            && self.action.as_deref().map_or(true, |action| record.action == action)
            && self.since.map_or(true, |since| record.timestamp >= since)
            && self.until.map_or(true, |until| record.timestamp < until)
    }

    /// Matching records, oldest first.
    pub fn apply<'a>(&self, records: &'a [DecisionRecord]) -> Vec<&'a DecisionRecord> {
        records.iter().filter(|record| self.matches(record)).collect()
    }
}
