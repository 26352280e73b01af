//! Retry policy execution for outbound calls
//!
//! A [`RetryPolicy`] is a plain value handed to [`execute_with_policy`].
//! Errors decide for themselves whether another attempt can help through
//! [`Retryable`]; callers that need a different rule pass a predicate to
//! [`execute_with_predicate`] instead.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::infrastructure::config::FetchConfig;

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }

    /// Wait after failed attempt `attempt` (1-based): `base * multiplier^(attempt-1)`, capped
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.multiplier
            .checked_pow(exponent)
            .map_or(self.max_delay, |factor| self.base_delay.saturating_mul(factor))
            .min(self.max_delay)
    }
}

/// Error classes that may succeed on a later attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// One attempt of one resilient call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchAttempt {
    pub target: String,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// Sleep before the next attempt; `None` when there is none
    pub next_backoff: Option<Duration>,
}

/// Run `operation` until it succeeds, fails terminally, or attempts run out.
/// The last error is returned on exhaustion.
pub async fn execute_with_policy<T, E, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    execute_traced(target, policy, operation).await.0
}

/// Same as [`execute_with_policy`] with an explicit retryable predicate
pub async fn execute_with_predicate<T, E, P, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    is_retryable: P,
    operation: F,
) -> Result<T, E>
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run(target, policy, is_retryable, operation).await.0
}

/// Same as [`execute_with_policy`], also returning every attempt made
pub async fn execute_traced<T, E, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    operation: F,
) -> (Result<T, E>, Vec<FetchAttempt>)
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run(target, policy, E::is_retryable, operation).await
}

async fn run<T, E, P, F, Fut>(
    target: &str,
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> (Result<T, E>, Vec<FetchAttempt>)
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = Vec::new();
    let mut attempt_number = 1;

    loop {
        let result = operation().await;
        let record = |outcome, next_backoff| FetchAttempt {
            target: target.to_string(),
            attempt_number,
            outcome,
            next_backoff,
        };

        match result {
            Ok(value) => {
                debug!("✅ {} succeeded on attempt {}", target, attempt_number);
                attempts.push(record(AttemptOutcome::Success, None));
                return (Ok(value), attempts);
            }
            Err(error) if !is_retryable(&error) => {
                debug!("❌ {} failed terminally: {}", target, error);
                attempts.push(record(AttemptOutcome::TerminalFailure, None));
                return (Err(error), attempts);
            }
            Err(error) if attempt_number >= max_attempts => {
                warn!("❌ {} failed after {} attempts: {}", target, attempt_number, error);
                attempts.push(record(AttemptOutcome::RetryableFailure, None));
                return (Err(error), attempts);
            }
            Err(error) => {
                let delay = policy.delay_for(attempt_number);
                warn!(
                    "🔄 {} attempt {}/{} failed: {} (retrying in {:?})",
                    target, attempt_number, max_attempts, error, delay
                );
                attempts.push(record(AttemptOutcome::RetryableFailure, Some(delay)));
                tokio::time::sleep(delay).await;
                attempt_number += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Flaky,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
        assert_eq!(policy.delay_for(200), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let (result, attempts) = execute_traced("card 1", &RetryPolicy::default(), || {
            let calls = Arc::clone(&calls);
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(TestError::Flaky),
                    _ => Ok("payload"),
                }
            }
        })
        .await;

        assert_eq!(result, Ok("payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));

        let outcomes: Vec<_> = attempts.iter().map(|a| (a.attempt_number, a.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (1, AttemptOutcome::RetryableFailure),
                (2, AttemptOutcome::RetryableFailure),
                (3, AttemptOutcome::Success),
            ]
        );
        assert_eq!(attempts[0].next_backoff, Some(Duration::from_secs(2)));
        assert_eq!(attempts[1].next_backoff, Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_does_not_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result: Result<(), _> = execute_with_policy("card 2", &RetryPolicy::default(), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            }
        })
        .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let (result, attempts): (Result<(), _>, _) =
            execute_traced("card 3", &RetryPolicy::default(), || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Flaky)
                }
            })
            .await;

        assert_eq!(result, Err(TestError::Flaky));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].next_backoff, None);
        assert!(started.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_overrides_error_classification() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), TestError> = execute_with_predicate(
            "card 4",
            &RetryPolicy::default(),
            |_| true,
            || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Fatal)
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
