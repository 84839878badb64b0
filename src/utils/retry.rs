//! Bounded retry with exponential backoff.
//!
//! One policy object serves every retried operation in the crate; what is
//! worth retrying is decided by the error type through [`Retryable`], or by
//! an explicit predicate via [`RetryPolicy::run_if`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::{FetchError, TestRunError};

/// Classifies an error as worth another attempt.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Server-provided hint for how long to wait before retrying.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Transient { retry_after, .. } => *retry_after,
            FetchError::Fatal { .. } => None,
        }
    }
}

impl Retryable for TestRunError {
    fn is_retryable(&self) -> bool {
        matches!(self, TestRunError::Timeout { .. })
    }
}

/// Retry configuration: attempt budget and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// raised to the server hint when one is given, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        let wanted = match hint {
            Some(h) if h > backoff => h,
            _ => backoff,
        };
        wanted.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_inner(operation, op, |e: &E| e.is_retryable(), |e: &E| e.retry_after())
            .await
    }

    /// Like [`run`](Self::run) but with a caller-supplied classification.
    pub async fn run_if<T, E, F, Fut, P>(&self, operation: &str, op: F, retryable: P) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.run_inner(operation, op, retryable, |_: &E| None).await
    }

    async fn run_inner<T, E, F, Fut, P, H>(
        &self,
        operation: &str,
        mut op: F,
        retryable: P,
        hint: H,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        H: Fn(&E) -> Option<Duration>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && retryable(&err) => {
                    let delay = self.delay_for(attempt, hint(&err));
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(8, None), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_honours_server_hint() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(3600))),
            policy.max_delay
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, FetchError> = fast_policy(3)
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(FetchError::transient("flaky", "HTTP 502"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FetchError> = fast_policy(3)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::transient("down", "HTTP 503"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), FetchError> = fast_policy(5)
            .run("missing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::fatal("missing", "HTTP 404"))
            })
            .await;
        assert!(matches!(result, Err(FetchError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_if_uses_predicate() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_policy(4)
            .run_if(
                "custom",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("nope".to_string())
                },
                |e| e == "retry me",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
