//! Self-healing engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::duration_ms;
use crate::healing::classify::{FailureClassifier, FailureKind};
use crate::healing::strategies::{FailureContext, Recover, RecoveryOutcome, Strategy};

/// Tuning for the built-in strategies and the healed wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// When false the executor never consults the engine.
    /// Default: true
    pub enabled: bool,
    /// Attempts made by [`SelfHealingEngine::execute_with_healing`].
    /// Default: 3
    pub max_attempts: u32,
    /// Default: 1 second
    #[serde(rename = "rate_limit_base_delay_ms", with = "duration_ms")]
    pub rate_limit_base_delay: Duration,
    /// Default: 60 seconds
    #[serde(rename = "rate_limit_max_delay_ms", with = "duration_ms")]
    pub rate_limit_max_delay: Duration,
    /// Default: 1 second
    #[serde(rename = "network_retry_delay_ms", with = "duration_ms")]
    pub network_retry_delay: Duration,
    /// Default: 8000
    pub max_input_chars: usize,
    /// Default: 2000
    pub max_line_chars: usize,
    /// Default: 2
    pub simplify_after_attempts: u32,
    /// Default: 2
    pub fallback_after_failures: u32,
    /// Default: "fallback"
    pub fallback_target: String,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            rate_limit_base_delay: Duration::from_secs(1),
            rate_limit_max_delay: Duration::from_secs(60),
            network_retry_delay: Duration::from_secs(1),
            max_input_chars: 8000,
            max_line_chars: 2000,
            simplify_after_attempts: 2,
            fallback_after_failures: 2,
            fallback_target: "fallback".to_string(),
        }
    }
}

impl HealingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Scale every built-in delay down to `delay`. Mostly useful in tests.
    pub fn with_delays(mut self, delay: Duration) -> Self {
        self.rate_limit_base_delay = delay;
        self.network_retry_delay = delay;
        self
    }

    pub fn with_max_input_chars(mut self, chars: usize) -> Self {
        self.max_input_chars = chars;
        self
    }

    pub fn with_fallback_target(mut self, target: impl Into<String>) -> Self {
        self.fallback_target = target.into();
        self
    }

    /// The built-in strategy set for this config.
    pub fn strategies(&self) -> Vec<Strategy> {
        vec![
            Strategy::RateLimitBackoff {
                base: self.rate_limit_base_delay,
                max: self.rate_limit_max_delay,
            },
            Strategy::NetworkRetry {
                delay: self.network_retry_delay,
            },
            Strategy::CompressInput {
                max_chars: self.max_input_chars,
                max_line_chars: self.max_line_chars,
            },
            Strategy::RepairOutput,
            Strategy::SimplifyTask {
                after_attempts: self.simplify_after_attempts,
            },
            Strategy::FallbackTarget {
                after_failures: self.fallback_after_failures,
                target: self.fallback_target.clone(),
            },
        ]
    }
}

/// What the caller should do after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum HealingDecision {
    /// Try again, with replacement input and delay if given.
    Retry {
        kind: FailureKind,
        strategy: &'static str,
        input: Option<Value>,
        delay: Option<Duration>,
    },
    /// Accept a salvaged result instead of retrying.
    Partial {
        kind: FailureKind,
        strategy: &'static str,
        result: Value,
    },
    /// No strategy could help.
    Unrecoverable { kind: FailureKind, reason: String },
}

impl HealingDecision {
    pub fn kind(&self) -> FailureKind {
        match self {
            HealingDecision::Retry { kind, .. }
            | HealingDecision::Partial { kind, .. }
            | HealingDecision::Unrecoverable { kind, .. } => *kind,
        }
    }

    pub fn strategy(&self) -> Option<&'static str> {
        match self {
            HealingDecision::Retry { strategy, .. } | HealingDecision::Partial { strategy, .. } => {
                Some(*strategy)
            }
            HealingDecision::Unrecoverable { .. } => None,
        }
    }
}

/// One failure recorded against a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
    pub attempt: u32,
    pub strategy: Option<&'static str>,
    pub at: DateTime<Utc>,
}

/// Per-strategy counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StrategyStats {
    pub attempts: u64,
    pub successes: u64,
}

/// Aggregate engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealingStats {
    pub failures_seen: u64,
    pub unrecoverable: u64,
    pub by_kind: HashMap<FailureKind, u64>,
    pub by_strategy: HashMap<&'static str, StrategyStats>,
}

/// Input to [`SelfHealingEngine::heal`].
#[derive(Debug, Clone, Copy)]
pub struct FailedAttempt<'a> {
    /// Scopes the failure history; failures from other builds never count.
    pub build_id: &'a str,
    pub task_id: &'a str,
    pub message: &'a str,
    pub attempt: u32,
    pub input: &'a Value,
    pub output: Option<&'a str>,
}

/// Returned by the healed wrapper when every attempt failed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{task_id} failed with {kind} after {attempts} attempt(s): {message}")]
pub struct HealingError {
    pub task_id: String,
    pub kind: FailureKind,
    pub attempts: u32,
    pub message: String,
}

/// Outcome of [`SelfHealingEngine::execute_with_healing`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealedRun {
    pub result: Result<Value, HealingError>,
    pub attempts: u32,
    /// True when a strategy changed the input or salvaged the result.
    pub healed: bool,
    /// True when the result came from output repair rather than a clean attempt.
    pub partial: bool,
    pub strategies: Vec<&'static str>,
}

/// Failure reported by an operation run under the healed wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub message: String,
    pub output: Option<String>,
}

impl From<String> for AttemptFailure {
    fn from(message: String) -> Self {
        Self {
            message,
            output: None,
        }
    }
}

impl From<&str> for AttemptFailure {
    fn from(message: &str) -> Self {
        Self::from(message.to_string())
    }
}

/// Classifies failures and selects remediation.
pub struct SelfHealingEngine {
    config: HealingConfig,
    classifier: FailureClassifier,
    strategies: Vec<Box<dyn Recover>>,
    /// Keyed by `(build_id, task_id)`.
    history: Mutex<HashMap<(String, String), Vec<FailureRecord>>>,
    stats: Mutex<HealingStats>,
}

impl std::fmt::Debug for SelfHealingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfHealingEngine")
            .field("config", &self.config)
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for SelfHealingEngine {
    fn default() -> Self {
        Self::new(HealingConfig::default())
    }
}

impl SelfHealingEngine {
    pub fn new(config: HealingConfig) -> Self {
        let strategies = config
            .strategies()
            .into_iter()
            .map(|strategy| Box::new(strategy) as Box<dyn Recover>)
            .collect();
        let mut engine = Self {
            config,
            classifier: FailureClassifier::new(),
            strategies,
            history: Mutex::new(HashMap::new()),
            stats: Mutex::new(HealingStats::default()),
        };
        engine.sort_strategies();
        engine
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Register an extra strategy. It is slotted in by priority.
    pub fn with_strategy(mut self, strategy: Box<dyn Recover>) -> Self {
        self.strategies.push(strategy);
        self.sort_strategies();
        self
    }

    pub fn config(&self) -> &HealingConfig {
        &self.config
    }

    pub fn classify(&self, message: &str) -> FailureKind {
        self.classifier.classify(message)
    }

    /// Strategy names in the order they are tried.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Classify a failed attempt and pick a remediation.
    pub fn heal(&self, failed: FailedAttempt<'_>) -> HealingDecision {
        let kind = self.classifier.classify(failed.message);
        let same_kind_failures = {
            let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history
                .get(&history_key(failed.build_id, failed.task_id))
                .map(|records| records.iter().filter(|r| r.kind == kind).count() as u32)
                .unwrap_or(0)
                + 1
        };

        let ctx = FailureContext {
            build_id: failed.build_id.to_string(),
            task_id: failed.task_id.to_string(),
            kind,
            message: failed.message.to_string(),
            attempt: failed.attempt,
            same_kind_failures,
            input: failed.input.clone(),
            output: failed.output.map(str::to_string),
        };

        let mut chosen: Option<(&'static str, RecoveryOutcome)> = None;
        for strategy in self.strategies.iter().filter(|s| s.can_recover(&ctx)) {
            let outcome = strategy.recover(&ctx);
            let actionable = outcome.is_actionable();
            self.count_strategy(strategy.name(), actionable);
            if actionable {
                chosen = Some((strategy.name(), outcome));
                break;
            }
            debug!(
                task_id = failed.task_id,
                strategy = strategy.name(),
                note = %outcome.note,
                "strategy declined"
            );
        }

        let decision = match chosen {
            Some((strategy, outcome)) if outcome.success && !outcome.should_retry => {
                match outcome.partial_result {
                    Some(result) => HealingDecision::Partial {
                        kind,
                        strategy,
                        result,
                    },
                    None => HealingDecision::Retry {
                        kind,
                        strategy,
                        input: outcome.new_input,
                        delay: outcome.delay,
                    },
                }
            }
            Some((strategy, outcome)) => HealingDecision::Retry {
                kind,
                strategy,
                input: outcome.new_input,
                delay: outcome.delay,
            },
            None => HealingDecision::Unrecoverable {
                kind,
                reason: format!("no recovery strategy applies to {kind}"),
            },
        };

        self.record(&ctx, &decision);
        decision
    }

    /// Run `operation` up to `max_attempts` times, healing between attempts.
    ///
    /// `operation` receives the current input and the zero-based attempt index.
    /// The task's history under `build_id` is cleared first, so each call
    /// starts fresh.
    pub async fn execute_with_healing<F, Fut>(
        &self,
        build_id: &str,
        task_id: &str,
        input: Value,
        mut operation: F,
    ) -> HealedRun
    where
        F: FnMut(Value, u32) -> Fut,
        Fut: Future<Output = Result<Value, AttemptFailure>>,
    {
        self.clear_history(build_id, task_id);
        let mut current = input;
        let mut strategies = Vec::new();
        let mut healed = false;
        let mut attempt = 0;

        loop {
            let failure = match operation(current.clone(), attempt).await {
                Ok(value) => {
                    return HealedRun {
                        result: Ok(value),
                        attempts: attempt + 1,
                        healed,
                        partial: false,
                        strategies,
                    }
                }
                Err(failure) => failure,
            };
            attempt += 1;

            let decision = self.heal(FailedAttempt {
                build_id,
                task_id,
                message: &failure.message,
                attempt,
                input: &current,
                output: failure.output.as_deref(),
            });
            let kind = decision.kind();
            let give_up = |attempts| HealingError {
                task_id: task_id.to_string(),
                kind,
                attempts,
                message: failure.message.clone(),
            };

            match decision {
                HealingDecision::Partial { strategy, result, .. } => {
                    strategies.push(strategy);
                    return HealedRun {
                        result: Ok(result),
                        attempts: attempt,
                        healed: true,
                        partial: true,
                        strategies,
                    };
                }
                HealingDecision::Unrecoverable { .. } => {
                    return HealedRun {
                        result: Err(give_up(attempt)),
                        attempts: attempt,
                        healed,
                        partial: false,
                        strategies,
                    };
                }
                HealingDecision::Retry {
                    strategy,
                    input,
                    delay,
                    ..
                } => {
                    strategies.push(strategy);
                    if attempt >= self.config.max_attempts {
                        return HealedRun {
                            result: Err(give_up(attempt)),
                            attempts: attempt,
                            healed,
                            partial: false,
                            strategies,
                        };
                    }
                    if let Some(input) = input {
                        healed = true;
                        current = input;
                    }
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Failures recorded for `task_id` within `build_id`, oldest first.
    pub fn history(&self, build_id: &str, task_id: &str) -> Vec<FailureRecord> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .get(&history_key(build_id, task_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Forget one task's failure history within a build.
    pub fn clear_history(&self, build_id: &str, task_id: &str) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.remove(&history_key(build_id, task_id));
    }

    /// Drop every failure recorded under `build_id`. Returns how many tasks had history.
    pub fn release_build(&self, build_id: &str) -> usize {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let before = history.len();
        history.retain(|(build, _), _| build != build_id);
        before - history.len()
    }

    /// Number of `(build, task)` pairs with recorded failures.
    pub fn tracked_tasks(&self) -> usize {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> HealingStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn sort_strategies(&mut self) {
        // Stable, so equal priorities keep registration order.
        self.strategies
            .sort_by_key(|strategy| std::cmp::Reverse(strategy.priority()));
    }

    fn count_strategy(&self, name: &'static str, succeeded: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.by_strategy.entry(name).or_default();
        entry.attempts += 1;
        if succeeded {
            entry.successes += 1;
        }
    }

    fn record(&self, ctx: &FailureContext, decision: &HealingDecision) {
        match decision {
            HealingDecision::Unrecoverable { reason, .. } => {
                warn!(
                    build_id = %ctx.build_id,
                    task_id = %ctx.task_id,
                    kind = %ctx.kind,
                    attempt = ctx.attempt,
                    reason = %reason,
                    "failure not healable"
                );
            }
            HealingDecision::Retry { strategy, .. } | HealingDecision::Partial { strategy, .. } => {
                info!(
                    build_id = %ctx.build_id,
                    task_id = %ctx.task_id,
                    kind = %ctx.kind,
                    attempt = ctx.attempt,
                    strategy = *strategy,
                    "healing applied"
                );
            }
        }

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.failures_seen += 1;
            *stats.by_kind.entry(ctx.kind).or_default() += 1;
            if matches!(decision, HealingDecision::Unrecoverable { .. }) {
                stats.unrecoverable += 1;
            }
        }

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history
            .entry(history_key(&ctx.build_id, &ctx.task_id))
            .or_default()
            .push(FailureRecord {
                kind: ctx.kind,
                message: ctx.message.clone(),
                attempt: ctx.attempt,
                strategy: decision.strategy(),
                at: Utc::now(),
            });
    }
}

fn history_key(build_id: &str, task_id: &str) -> (String, String) {
    (build_id.to_string(), task_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> SelfHealingEngine {
        SelfHealingEngine::new(HealingConfig::new().with_delays(Duration::from_millis(1)))
    }

    fn failed<'a>(task_id: &'a str, message: &'a str, attempt: u32, input: &'a Value) -> FailedAttempt<'a> {
        FailedAttempt {
            build_id: "build-1",
            task_id,
            message,
            attempt,
            input,
            output: None,
        }
    }

    // ========================================================================
    // heal
    // ========================================================================

    #[test]
    fn test_strategies_sorted_by_priority() {
        assert_eq!(
            engine().strategy_names(),
            vec![
                "rate_limit_backoff",
                "network_retry",
                "compress_input",
                "repair_output",
                "simplify_task",
                "fallback_target",
            ]
        );
    }

    #[test]
    fn test_rate_limit_yields_retry_with_delay() {
        let engine = engine();
        let input = json!({});

        let decision = engine.heal(failed("a", "429 rate limit", 1, &input));

        match decision {
            HealingDecision::Retry {
                kind,
                strategy,
                delay,
                ..
            } => {
                assert_eq!(kind, FailureKind::RateLimit);
                assert_eq!(strategy, "rate_limit_backoff");
                assert_eq!(delay, Some(Duration::from_millis(1)));
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_unknown_first_failure_is_unrecoverable() {
        let engine = engine();
        let input = json!({});

        let decision = engine.heal(failed("a", "segfault", 1, &input));

        assert!(matches!(
            decision,
            HealingDecision::Unrecoverable {
                kind: FailureKind::Unknown,
                ..
            }
        ));
        assert_eq!(engine.stats().unrecoverable, 1);
    }

    #[test]
    fn test_repeated_same_kind_falls_back() {
        let engine = engine();
        let input = json!({ "simplified": true });

        let first = engine.heal(failed("a", "model overloaded", 1, &input));
        assert!(matches!(first, HealingDecision::Unrecoverable { .. }));

        let second = engine.heal(failed("a", "model overloaded", 2, &input));
        assert_eq!(second.strategy(), Some("fallback_target"));
        assert_eq!(engine.history("build-1", "a").len(), 2);
    }

    #[test]
    fn test_history_is_scoped_to_build() {
        let engine = engine();
        let input = json!({});

        engine.heal(failed("a", "model overloaded", 1, &input));
        let other_build = engine.heal(FailedAttempt {
            build_id: "build-2",
            ..failed("a", "model overloaded", 1, &input)
        });

        assert!(matches!(other_build, HealingDecision::Unrecoverable { .. }));
        assert_eq!(engine.history("build-1", "a").len(), 1);
        assert_eq!(engine.history("build-2", "a").len(), 1);

        assert_eq!(engine.release_build("build-1"), 1);
        assert!(engine.history("build-1", "a").is_empty());
        assert_eq!(engine.tracked_tasks(), 1);
    }

    #[test]
    fn test_repair_yields_partial() {
        let engine = engine();
        let input = json!({});

        let decision = engine.heal(FailedAttempt {
            output: Some("{\"ok\": true,}"),
            ..failed("a", "invalid JSON in response", 1, &input)
        });

        assert_eq!(
            decision,
            HealingDecision::Partial {
                kind: FailureKind::InvalidOutput,
                strategy: "repair_output",
                result: json!({ "ok": true }),
            }
        );
    }

    #[test]
    fn test_custom_strategy_is_ordered_by_priority() {
        struct AlwaysRetry;
        impl Recover for AlwaysRetry {
            fn name(&self) -> &'static str {
                "always_retry"
            }
            fn priority(&self) -> u32 {
                200
            }
            fn can_recover(&self, _ctx: &FailureContext) -> bool {
                true
            }
            fn recover(&self, _ctx: &FailureContext) -> RecoveryOutcome {
                RecoveryOutcome {
                    should_retry: true,
                    ..RecoveryOutcome::default()
                }
            }
        }

        let engine = engine().with_strategy(Box::new(AlwaysRetry));
        let input = json!({});

        assert_eq!(engine.strategy_names()[0], "always_retry");
        assert_eq!(
            engine.heal(failed("a", "segfault", 1, &input)).strategy(),
            Some("always_retry")
        );
        assert_eq!(engine.stats().by_strategy["always_retry"].successes, 1);
    }

    // ========================================================================
    // execute_with_healing
    // ========================================================================

    #[tokio::test]
    async fn test_healed_wrapper_substitutes_compressed_input() {
        let engine = SelfHealingEngine::new(
            HealingConfig::new()
                .with_delays(Duration::from_millis(1))
                .with_max_input_chars(50),
        );
        let long_input = json!({ "input": "context ".repeat(100) });

        let run = engine
            .execute_with_healing("build-1", "writer", long_input, |input, _| async move {
                let text = input["input"].as_str().unwrap_or_default().to_string();
                if text.len() > 50 {
                    Err(AttemptFailure::from("maximum context length exceeded"))
                } else {
                    Ok(json!({ "chars": text.len() }))
                }
            })
            .await;

        assert!(run.result.is_ok());
        assert_eq!(run.attempts, 2);
        assert!(run.healed);
        assert_eq!(run.strategies, vec!["compress_input"]);
    }

    #[tokio::test]
    async fn test_healed_wrapper_stops_when_unrecoverable() {
        let engine = engine();
        let calls = AtomicU32::new(0);

        let run = engine
            .execute_with_healing("build-1", "writer", json!({}), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptFailure::from("segfault")) }
            })
            .await;

        let err = run.result.unwrap_err();
        assert_eq!(err.kind, FailureKind::Unknown);
        assert_eq!(err.attempts, 1);
        assert!(!run.healed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_healed_wrapper_respects_max_attempts() {
        let engine = SelfHealingEngine::new(
            HealingConfig::new()
                .with_delays(Duration::from_millis(1))
                .with_max_attempts(2),
        );

        let run = engine
            .execute_with_healing("build-1", "writer", json!({}), |_, _| async {
                Err(AttemptFailure::from("429 too many requests"))
            })
            .await;

        assert_eq!(run.attempts, 2);
        assert_eq!(run.result.unwrap_err().kind, FailureKind::RateLimit);
    }
}
