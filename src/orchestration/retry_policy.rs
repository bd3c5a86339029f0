//! # Retry Policy
//!
//! Pure decision function consumed by the executor after a failed attempt:
//! `(attempt_count, failure class, budget, server hint) -> retry after d | terminal`.
//!
//! ## Backoff
//!
//! Exponential with a fixed base doubling per attempt, capped at a maximum:
//! attempt 1 waits `base`, attempt 2 waits `2 * base`, attempt 3 waits
//! `4 * base`, and so on up to `max_delay`. A server-requested delay (a
//! rate-limit `Retry-After`) replaces the computed one but is held to the
//! same `max_delay` cap.

use crate::config::BackoffConfig;
use crate::models::FailureClass;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Terminal,
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter(delay) => Some(*delay),
            Self::Terminal => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    /// Delay after the `attempt`-th (1-based) failed attempt
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what happens after a failed attempt.
    ///
    /// `attempt_count` counts attempts made so far in the current retry
    /// generation, including the one that just failed; `budget` is the number
    /// of retries allowed after the first attempt.
    pub fn decide(
        &self,
        attempt_count: u32,
        class: FailureClass,
        budget: u32,
        retry_after_hint: Option<Duration>,
    ) -> RetryDecision {
        if class != FailureClass::Retryable || attempt_count > budget {
            return RetryDecision::Terminal;
        }
        let delay = match retry_after_hint {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff_delay(attempt_count),
        };
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(2))
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(500), Duration::from_secs(2));
    }

    #[test]
    fn test_budget_of_two_allows_three_attempts() {
        let policy = policy();
        assert_eq!(
            policy.decide(1, FailureClass::Retryable, 2, None),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(2, FailureClass::Retryable, 2, None),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert!(policy.decide(3, FailureClass::Retryable, 2, None).is_terminal());
    }

    #[test]
    fn test_terminal_classes_never_retry() {
        let policy = policy();
        assert!(policy.decide(1, FailureClass::TerminalUnit, 5, None).is_terminal());
        assert!(policy.decide(1, FailureClass::TerminalRun, 5, None).is_terminal());
    }

    #[test]
    fn test_server_hint_replaces_backoff() {
        let decision = policy().decide(1, FailureClass::Retryable, 2, Some(Duration::from_millis(1_500)));
        assert_eq!(decision.delay(), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn test_server_hint_is_held_to_max_delay() {
        let decision = policy().decide(1, FailureClass::Retryable, 2, Some(Duration::from_secs(3_600)));
        assert_eq!(decision.delay(), Some(Duration::from_secs(2)));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(attempt in 1u32..64) {
            let policy = policy();
            prop_assert!(policy.backoff_delay(attempt) <= policy.max_delay);
            prop_assert!(policy.backoff_delay(attempt) >= policy.base_delay.min(policy.max_delay));
        }

        #[test]
        fn prop_retry_delay_never_exceeds_cap(attempt in 1u32..4, hint_ms in proptest::option::of(0u64..86_400_000)) {
            let policy = policy();
            let decision = policy.decide(attempt, FailureClass::Retryable, 3, hint_ms.map(Duration::from_millis));
            let delay = decision.delay().expect("retryable within budget");
            prop_assert!(delay <= policy.max_delay);
        }
    }
}
