//! Transient-failure handling per named resource.
//!
//! [`RetryPolicy`] bounds how often and how slowly an operation is retried;
//! [`CircuitBreakerRegistry`] keeps one breaker per resource so a failing
//! target is rejected outright until it cools down.

pub mod circuit;
pub mod retry;

use std::fmt::{Debug, Display};
use std::future::Future;

pub use circuit::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError,
    CircuitState,
};
pub use retry::{Retried, RetryError, RetryPolicy};

/// A retry policy paired with per-resource breakers.
#[derive(Debug, Default)]
pub struct Resilience {
    policy: RetryPolicy,
    breakers: CircuitBreakerRegistry,
}

impl Resilience {
    pub fn new(policy: RetryPolicy, breakers: CircuitBreakerConfig) -> Self {
        Self {
            policy,
            breakers: CircuitBreakerRegistry::new(breakers),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Run `operation` for `resource` under its breaker and the retry policy.
    pub async fn call<F, Fut, T, E>(&self, resource: &str, operation: F) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display + Debug,
    {
        let breaker = self.breakers.breaker(resource);
        self.policy.execute(resource, Some(&breaker), operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_call_shares_breaker_across_calls() {
        let resilience = Resilience::new(
            RetryPolicy::none(),
            CircuitBreakerConfig::new().with_failure_threshold(2),
        );

        for _ in 0..2 {
            let result: Result<Retried<()>, _> = resilience.call("chain", |_| async { Err("io") }).await;
            assert!(matches!(result, Err(RetryError::Exhausted { .. })));
        }

        let result: Result<Retried<()>, _> = resilience.call("chain", |_| async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(RetryError::CircuitOpen(_))));
        assert_eq!(resilience.breakers().breaker("chain").state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_retries_with_policy() {
        let resilience = Resilience::new(
            RetryPolicy::new().with_max_retries(1).with_base_delay(Duration::from_millis(1)),
            CircuitBreakerConfig::default(),
        );
        let mut seen = Vec::new();

        let result = resilience
            .call("writer", |attempt| {
                seen.push(attempt);
                async move {
                    if attempt == 0 {
                        Err("flaky")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .expect("second attempt succeeds");

        assert_eq!(result.value, 1);
        assert_eq!(seen, vec![0, 1]);
    }
}
