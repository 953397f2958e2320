// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies with fixed, linear and exponential backoff.

use crate::error::Result;
use crate::workflow::{BackoffStrategy, RetrySpec};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Resolved retry policy for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffStrategy,
    /// Upper bound applied to every computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Fixed,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_spec(spec: &RetrySpec, max_delay: Duration) -> Self {
        Self {
            max_attempts: spec.max_attempts.max(1),
            delay: spec.delay,
            backoff: spec.backoff,
            max_delay,
        }
    }

    /// Delay before retrying after the given 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = match self.backoff {
            BackoffStrategy::Fixed => 1.0,
            BackoffStrategy::Linear => attempt as f64,
            BackoffStrategy::Exponential => 2f64.powi(attempt.saturating_sub(1) as i32),
        };
        let computed = self.delay.mul_f64(factor);
        computed.min(self.max_delay)
    }
}

/// Drives an async operation under a retry policy.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs the operation until it succeeds or attempts are exhausted.
    /// Returns the last error alongside the number of attempts made.
    /// Cancellation errors are not retried.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_cancelled() => return (Err(err), attempt),
                Err(err) => {
                    if attempt >= self.policy.max_attempts {
                        return (Err(err), attempt);
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, delay_ms: u64, backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(delay_ms),
            backoff,
            max_delay: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let p = policy(3, 100, BackoffStrategy::Fixed);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_backoff() {
        let p = policy(4, 100, BackoffStrategy::Linear);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_backoff() {
        let p = policy(4, 100, BackoffStrategy::Exponential);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_cap() {
        let mut p = policy(10, 100, BackoffStrategy::Exponential);
        p.max_delay = Duration::from_millis(250);
        assert_eq!(p.delay_for(4), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_nth_attempt() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(policy(3, 10, BackoffStrategy::Fixed));

        let (result, attempts) = executor
            .execute(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(EngineError::Validation("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let executor = RetryExecutor::new(policy(2, 10, BackoffStrategy::Fixed));
        let (result, attempts) = executor
            .execute(|_| async { Err::<(), _>(EngineError::Validation("always".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_retried() {
        let executor = RetryExecutor::new(policy(5, 10, BackoffStrategy::Fixed));
        let (result, attempts) = executor
            .execute(|_| async { Err::<(), _>(EngineError::Cancelled) })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(attempts, 1);
    }
}
