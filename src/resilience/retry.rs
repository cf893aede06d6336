// Retry logic for remote and local operations.
// Delays grow by the configured strategy and are always capped at max_delay.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.config.base_delay;
        let delay = match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        };
        delay.min(self.config.max_delay)
    }

    /// Run `operation`, re-invoking it while it fails with a retryable error.
    ///
    /// Non-retryable errors are returned immediately. When attempts run out the
    /// last error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        error!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Operation failed after exhausting retries"
                        );
                    } else {
                        debug!(operation = operation_name, error = %err, "Non-retryable failure");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqiError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(strategy: BackoffStrategy, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            strategy,
        })
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let p = policy(BackoffStrategy::Exponential, 5);
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(p.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(p.delay_for_attempt(40), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_and_linear_delays() {
        let fixed = policy(BackoffStrategy::Fixed, 3);
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_secs(1));

        let linear = policy(BackoffStrategy::Linear, 3);
        assert_eq!(linear.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(linear.delay_for_attempt(9), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failure() {
        let p = policy(BackoffStrategy::Exponential, 3);
        let attempts = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = attempts.clone();
        let result = p
            .execute("flaky", || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(MqiError::Connection("reset by peer".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // slept 1s then 2s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_sleeps_between_each_attempt() {
        let p = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
            strategy: BackoffStrategy::Exponential,
        });
        let invoked_at = Arc::new(std::sync::Mutex::new(Vec::new()));

        let log = invoked_at.clone();
        let result = p
            .execute("four_failures", || {
                let log = log.clone();
                async move {
                    let mut log = log.lock().unwrap();
                    log.push(tokio::time::Instant::now());
                    if log.len() <= 4 {
                        Err(MqiError::Retryable(format!("failure {}", log.len())))
                    } else {
                        Ok("dose ready")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "dose ready");
        let invoked_at = invoked_at.lock().unwrap();
        assert_eq!(invoked_at.len(), 5);
        let delays: Vec<Duration> = invoked_at.windows(2).map(|w| w[1] - w[0]).collect();
        for (observed, expected_ms) in delays.iter().zip([100u64, 200, 400, 800]) {
            let expected = Duration::from_millis(expected_ms);
            assert!(
                *observed >= expected && *observed < expected + Duration::from_millis(5),
                "slept {:?}, expected {:?}",
                observed,
                expected
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let p = policy(BackoffStrategy::Fixed, 3);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result: Result<()> = p
            .execute("always_down", || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(MqiError::Connection(format!("failure {}", n + 1)))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(MqiError::Connection(msg)) => assert_eq!(msg, "failure 3"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let p = policy(BackoffStrategy::Exponential, 5);
        let attempts = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = attempts.clone();
        let result: Result<()> = p
            .execute("bad_input", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(MqiError::Validation("missing file".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(MqiError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
