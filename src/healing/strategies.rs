//! Recovery strategies.
//!
//! Each strategy decides whether it applies to a [`FailureContext`] and, if
//! so, produces a [`RecoveryOutcome`]: a retry (possibly with rewritten input
//! or an explicit delay), a partial result, or nothing useful. The engine
//! tries strategies in descending priority.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::healing::classify::FailureKind;

/// Key holding the task's free-text input inside its opaque config.
pub const INPUT_KEY: &str = "input";

/// Marker appended when input is cut short.
const TRUNCATION_MARKER: &str = " [truncated]";

static RETRY_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry[\s_-]?after\D{0,3}(\d+)").expect("static regex"));
static EXAMPLE_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<examples?>.*?</examples?>").expect("static regex"));
static EXAMPLE_SECTIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(for )?examples?:.*(\n.+)*\n?").expect("static regex")
});
static INLINE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n(\s*\n)+").expect("static regex"));
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex"));
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("static regex"));
static SINGLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^'\\]*)'").expect("static regex"));
static UNQUOTED_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").expect("static regex"));

/// Everything a strategy may inspect about one failed attempt.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub build_id: String,
    pub task_id: String,
    pub kind: FailureKind,
    pub message: String,
    /// One-based number of the attempt that failed.
    pub attempt: u32,
    /// Failures of `kind` recorded for this task in this build, including this one.
    pub same_kind_failures: u32,
    /// The config the failed attempt ran with.
    pub input: Value,
    /// Raw output of the failed attempt, when the executor produced any.
    pub output: Option<String>,
}

impl FailureContext {
    fn input_text(&self) -> Option<&str> {
        self.input.get(INPUT_KEY).and_then(Value::as_str)
    }

    fn flag(&self, key: &str) -> bool {
        self.input.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Copy of the input with `key` set.
    fn input_with(&self, key: &str, value: Value) -> Value {
        let mut map = match &self.input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert(INPUT_KEY.to_string(), other.clone());
                map
            }
        };
        map.insert(key.to_string(), value);
        Value::Object(map)
    }
}

/// Result of one strategy's attempt at remediation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub new_input: Option<Value>,
    pub partial_result: Option<Value>,
    pub should_retry: bool,
    pub delay: Option<Duration>,
    pub note: String,
}

impl RecoveryOutcome {
    fn retry(note: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            note: note.into(),
            ..Self::default()
        }
    }

    fn with_input(mut self, input: Value) -> Self {
        self.new_input = Some(input);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// True when the engine should act on this outcome.
    pub fn is_actionable(&self) -> bool {
        self.success || self.should_retry
    }
}

/// Capability shared by every recovery strategy.
pub trait Recover: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> u32;
    fn can_recover(&self, ctx: &FailureContext) -> bool;
    fn recover(&self, ctx: &FailureContext) -> RecoveryOutcome;
}

/// Built-in strategies.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Wait out a rate limit, honoring a `retry after N` hint.
    RateLimitBackoff { base: Duration, max: Duration },
    /// Retry on a fresh connection.
    NetworkRetry { delay: Duration },
    /// Shrink input that overflowed the context.
    CompressInput { max_chars: usize, max_line_chars: usize },
    /// Salvage malformed structured output, or ask again more strictly.
    RepairOutput,
    /// Reduce the task's scope after repeated failures.
    SimplifyTask { after_attempts: u32 },
    /// Move the task to another execution target.
    FallbackTarget { after_failures: u32, target: String },
}

impl Recover for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::RateLimitBackoff { .. } => "rate_limit_backoff",
            Strategy::NetworkRetry { .. } => "network_retry",
            Strategy::CompressInput { .. } => "compress_input",
            Strategy::RepairOutput => "repair_output",
            Strategy::SimplifyTask { .. } => "simplify_task",
            Strategy::FallbackTarget { .. } => "fallback_target",
        }
    }

    fn priority(&self) -> u32 {
        match self {
            Strategy::RateLimitBackoff { .. } => 100,
            Strategy::NetworkRetry { .. } => 90,
            Strategy::CompressInput { .. } => 85,
            Strategy::RepairOutput => 80,
            Strategy::SimplifyTask { .. } => 50,
            Strategy::FallbackTarget { .. } => 40,
        }
    }

    fn can_recover(&self, ctx: &FailureContext) -> bool {
        match self {
            Strategy::RateLimitBackoff { .. } => ctx.kind == FailureKind::RateLimit,
            Strategy::NetworkRetry { .. } => ctx.kind == FailureKind::NetworkError,
            Strategy::CompressInput { .. } => {
                ctx.kind == FailureKind::ContextOverflow && ctx.input_text().is_some()
            }
            Strategy::RepairOutput => ctx.kind == FailureKind::InvalidOutput,
            Strategy::SimplifyTask { after_attempts } => {
                ctx.attempt >= *after_attempts && !ctx.flag("simplified")
            }
            Strategy::FallbackTarget {
                after_failures,
                target,
            } => {
                ctx.same_kind_failures >= *after_failures
                    && ctx.input.get("target").and_then(Value::as_str) != Some(target.as_str())
            }
        }
    }

    fn recover(&self, ctx: &FailureContext) -> RecoveryOutcome {
        match self {
            Strategy::RateLimitBackoff { base, max } => {
                let delay = retry_after(&ctx.message).unwrap_or_else(|| {
                    let exponent = ctx.attempt.saturating_sub(1).min(16);
                    base.saturating_mul(1 << exponent)
                });
                RecoveryOutcome::retry("waiting out rate limit").with_delay(delay.min(*max))
            }
            Strategy::NetworkRetry { delay } => RecoveryOutcome::retry("retrying on a fresh connection")
                .with_input(ctx.input_with("fresh_connection", Value::Bool(true)))
                .with_delay(*delay),
            Strategy::CompressInput {
                max_chars,
                max_line_chars,
            } => {
                let Some(text) = ctx.input_text() else {
                    return RecoveryOutcome::default();
                };
                let compressed = compress(text, *max_chars, *max_line_chars);
                if compressed.len() >= text.len() {
                    return RecoveryOutcome {
                        note: "input could not be compressed further".to_string(),
                        ..RecoveryOutcome::default()
                    };
                }
                RecoveryOutcome::retry(format!(
                    "compressed input from {} to {} chars",
                    text.len(),
                    compressed.len()
                ))
                .with_input(ctx.input_with(INPUT_KEY, Value::String(compressed)))
            }
            Strategy::RepairOutput => {
                if let Some(value) = ctx.output.as_deref().and_then(repair_json) {
                    return RecoveryOutcome {
                        success: true,
                        partial_result: Some(value),
                        note: "repaired malformed output".to_string(),
                        ..RecoveryOutcome::default()
                    };
                }
                let mut input = ctx.input_with("strict_output", Value::Bool(true));
                if let Some(text) = ctx.input_text() {
                    if let Value::Object(map) = &mut input {
                        map.insert(
                            INPUT_KEY.to_string(),
                            Value::String(format!(
                                "{text}\n\nRespond with valid JSON only. No prose, no code fences."
                            )),
                        );
                    }
                }
                RecoveryOutcome::retry("re-asking with strict output instructions").with_input(input)
            }
            Strategy::SimplifyTask { .. } => {
                let mut input = ctx.input_with("simplified", Value::Bool(true));
                if let Value::Object(map) = &mut input {
                    map.insert("detail_level".to_string(), Value::String("minimal".to_string()));
                }
                RecoveryOutcome::retry(format!("simplified after {} attempts", ctx.attempt))
                    .with_input(input)
            }
            Strategy::FallbackTarget { target, .. } => {
                RecoveryOutcome::retry(format!("falling back to target {target}"))
                    .with_input(ctx.input_with("target", Value::String(target.clone())))
            }
        }
    }
}

/// Seconds requested by a `retry after N` hint in an error message.
pub fn retry_after(message: &str) -> Option<Duration> {
    RETRY_AFTER
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Strip embedded examples, truncate long lines, collapse whitespace, then cap length.
pub fn compress(text: &str, max_chars: usize, max_line_chars: usize) -> String {
    let stripped = EXAMPLE_TAGS.replace_all(text, "");
    let stripped = EXAMPLE_SECTIONS.replace_all(&stripped, "");

    let lines: Vec<String> = stripped
        .lines()
        .map(|line| {
            let line = INLINE_WHITESPACE.replace_all(line.trim_end(), " ");
            truncate_chars(&line, max_line_chars)
        })
        .collect();
    let joined = lines.join("\n");
    let collapsed = BLANK_LINES.replace_all(joined.trim(), "\n\n");

    truncate_chars(&collapsed, max_chars)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(TRUNCATION_MARKER.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Try to recover a JSON value from malformed model output.
pub fn repair_json(raw: &str) -> Option<Value> {
    let candidate = extract_json(raw)?;
    if let Ok(value) = serde_json::from_str(&candidate) {
        return Some(value);
    }

    let fixed = TRAILING_COMMA.replace_all(&candidate, "$1");
    if let Ok(value) = serde_json::from_str(&fixed) {
        return Some(value);
    }

    let quoted = SINGLE_QUOTED.replace_all(&fixed, "\"$1\"");
    let quoted = UNQUOTED_KEY.replace_all(&quoted, "$1\"$2\"$3");
    serde_json::from_str(&quoted).ok()
}

fn extract_json(raw: &str) -> Option<String> {
    let body = CODE_FENCE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);

    let start = body.find(['{', '['])?;
    let close = if body[start..].starts_with('{') { '}' } else { ']' };
    let end = body.rfind(close)?;
    (end > start).then(|| body[start..=end].to_string())
}
