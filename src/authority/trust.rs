//! Build-scoped trust score.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_TRUST: i32 = 100;
pub const MIN_TRUST: i32 = 0;

/// Band a trust score falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustBand {
    Compromised,
    Untrusted,
    Degraded,
    Trusted,
}

impl TrustBand {
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 80 => TrustBand::Trusted,
            s if s >= 50 => TrustBand::Degraded,
            s if s >= 20 => TrustBand::Untrusted,
            _ => TrustBand::Compromised,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustBand::Trusted => "trusted",
            TrustBand::Degraded => "degraded",
            TrustBand::Untrusted => "untrusted",
            TrustBand::Compromised => "compromised",
        }
    }
}

impl fmt::Display for TrustBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named change to a trust score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustFactor {
    pub name: String,
    /// Requested signed change.
    pub impact: i32,
    pub reason: String,
    pub score_before: i32,
    /// Score after clamping to `[0, 100]`.
    pub score_after: i32,
    pub applied_at: DateTime<Utc>,
}

/// Score in `[0, 100]` plus the factors that produced it.
///
/// The score only moves through [`TrustLevel::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustLevel {
    score: i32,
    factors: Vec<TrustFactor>,
}

impl Default for TrustLevel {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustLevel {
    /// Fully trusted, no history.
    pub fn new() -> Self {
        Self {
            score: MAX_TRUST,
            factors: Vec::new(),
        }
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn band(&self) -> TrustBand {
        TrustBand::from_score(self.score)
    }

    /// Factors applied so far, oldest first.
    pub fn factors(&self) -> &[TrustFactor] {
        &self.factors
    }

    /// The factor `impact` would produce, without applying it.
    pub fn preview(&self, name: impl Into<String>, impact: i32, reason: impl Into<String>) -> TrustFactor {
        TrustFactor {
            name: name.into(),
            impact,
            reason: reason.into(),
            score_before: self.score,
            score_after: self.score.saturating_add(impact).clamp(MIN_TRUST, MAX_TRUST),
            applied_at: Utc::now(),
        }
    }

    /// Apply a factor produced by [`TrustLevel::preview`] on this level.
    pub fn apply(&mut self, factor: TrustFactor) -> &TrustFactor {
        self.score = self.score.saturating_add(factor.impact).clamp(MIN_TRUST, MAX_TRUST);
        self.factors.push(factor);
        &self.factors[self.factors.len() - 1]
    }
}
