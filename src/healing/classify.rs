//! Failure classification.
//!
//! Error text is matched against an ordered table of `(pattern, kind)` rows.
//! The first row that matches wins; nothing matching yields [`FailureKind::Unknown`].

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The kind of failure a task attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimit,
    Timeout,
    InvalidOutput,
    ContextOverflow,
    ModelError,
    ValidationError,
    NetworkError,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Timeout => "timeout",
            FailureKind::InvalidOutput => "invalid_output",
            FailureKind::ContextOverflow => "context_overflow",
            FailureKind::ModelError => "model_error",
            FailureKind::ValidationError => "validation_error",
            FailureKind::NetworkError => "network_error",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Rate limits, timeouts and network errors are expected to pass on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimit | FailureKind::Timeout | FailureKind::NetworkError
        )
    }

    /// Failures that need the input or the output handling changed.
    pub fn is_semantic(&self) -> bool {
        matches!(
            self,
            FailureKind::InvalidOutput | FailureKind::ContextOverflow | FailureKind::ValidationError
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Rule {
    pattern: Regex,
    kind: FailureKind,
}

impl Rule {
    fn new(pattern: &str, kind: FailureKind) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("static regex"),
            kind,
        }
    }
}

/// Default rows, in priority order.
static DEFAULT_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new(
            r"(?i)rate[\s_-]?limit|\b429\b|too many requests|quota exceeded",
            FailureKind::RateLimit,
        ),
        Rule::new(
            r"(?i)timed?[\s_-]?out|deadline exceeded|etimedout",
            FailureKind::Timeout,
        ),
        Rule::new(
            r"(?i)invalid json|unexpected token|json parse|failed to parse|malformed|unexpected end of (json )?input|expected value",
            FailureKind::InvalidOutput,
        ),
        Rule::new(
            r"(?i)context[\s_-]?(length|window|overflow)|maximum context|too many tokens|token limit|prompt is too long",
            FailureKind::ContextOverflow,
        ),
        Rule::new(
            r"(?i)overloaded|model (error|unavailable|not found)|internal server error|\b50[0234]\b",
            FailureKind::ModelError,
        ),
        Rule::new(
            r"(?i)validation|schema|required field|missing field|invalid (argument|parameter|value)",
            FailureKind::ValidationError,
        ),
        Rule::new(
            r"(?i)network|econnreset|econnrefused|connection (reset|refused|closed|aborted)|socket hang up|dns|broken pipe",
            FailureKind::NetworkError,
        ),
    ]
});

/// Maps error text to a [`FailureKind`].
///
/// Extra rows registered with [`FailureClassifier::with_rule`] are checked
/// before the built-in table.
#[derive(Default)]
pub struct FailureClassifier {
    custom: Vec<Rule>,
}

impl fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureClassifier")
            .field("custom_rules", &self.custom.len())
            .finish()
    }
}

impl FailureClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a higher-priority row. Fails if `pattern` is not a valid regex.
    pub fn with_rule(mut self, pattern: &str, kind: FailureKind) -> Result<Self, regex::Error> {
        self.custom.push(Rule {
            pattern: Regex::new(pattern)?,
            kind,
        });
        Ok(self)
    }

    pub fn classify(&self, message: &str) -> FailureKind {
        self.custom
            .iter()
            .chain(DEFAULT_RULES.iter())
            .find(|rule| rule.pattern.is_match(message))
            .map(|rule| rule.kind)
            .unwrap_or(FailureKind::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_each_kind() {
        let classifier = FailureClassifier::new();
        let cases = [
            ("429 Too Many Requests", FailureKind::RateLimit),
            ("rate_limit_error: slow down", FailureKind::RateLimit),
            ("task build timed out after 300000ms", FailureKind::Timeout),
            ("Unexpected token } in JSON at position 10", FailureKind::InvalidOutput),
            ("prompt exceeds maximum context length", FailureKind::ContextOverflow),
            ("model overloaded, try later", FailureKind::ModelError),
            ("schema mismatch: missing field `name`", FailureKind::ValidationError),
            ("ECONNRESET while reading body", FailureKind::NetworkError),
            ("something odd happened", FailureKind::Unknown),
        ];

        for (message, expected) in cases {
            assert_eq!(classifier.classify(message), expected, "{message}");
        }
    }

    #[test]
    fn test_earlier_rows_win() {
        let classifier = FailureClassifier::new();
        // Mentions both a timeout and the network; timeout is checked first.
        assert_eq!(
            classifier.classify("network request timed out"),
            FailureKind::Timeout
        );
    }

    #[test]
    fn test_custom_rules_take_precedence() {
        let classifier = FailureClassifier::new()
            .with_rule(r"(?i)sandbox denied", FailureKind::ValidationError)
            .expect("valid pattern");

        assert_eq!(
            classifier.classify("sandbox denied network access"),
            FailureKind::ValidationError
        );
        assert!(FailureClassifier::new().with_rule("(", FailureKind::Unknown).is_err());
    }

    #[test]
    fn test_transient_and_semantic_groups() {
        assert!(FailureKind::RateLimit.is_transient());
        assert!(FailureKind::ContextOverflow.is_semantic());
        assert!(!FailureKind::Unknown.is_transient());
        assert_eq!(FailureKind::InvalidOutput.to_string(), "invalid_output");
    }
}
