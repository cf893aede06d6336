use crate::error::{MqiError, Result};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Fails fast once a dependency has failed `failure_threshold` times.
///
/// After `timeout` has elapsed since opening, one probe call is let through
/// (half-open). Its success closes the breaker and resets the count; its
/// failure opens it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            match inner.opened_at {
                Some(opened) if opened.elapsed() >= self.config.timeout => {
                    inner.state = CircuitState::HalfOpen;
                    info!(breaker = %self.name, "Circuit breaker half-open, probing");
                }
                _ => return Err(MqiError::CircuitOpen),
            }
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "Circuit breaker closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    fn record_failure(&self, err: &MqiError) {
        let mut inner = self.lock();
        inner.failure_count += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    error = %err,
                    "Probe failed, circuit breaker re-opened"
                );
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                error!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    error = %err,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                timeout: Duration::from_secs(60),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MqiError::Connection("down".into()))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_fails_fast() {
        let cb = breaker();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&cb, &calls).await, Err(MqiError::Connection(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result = succeed(&cb, &calls).await;
        assert!(matches!(result, Err(MqiError::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(succeed(&cb, &calls).await, Err(MqiError::CircuitOpen)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            let _ = fail(&cb, &calls).await;
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(fail(&cb, &calls).await, Err(MqiError::Connection(_))));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 4);
        assert!(matches!(succeed(&cb, &calls).await, Err(MqiError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_open_then_timeout_allows_recovery() {
        let cb = CircuitBreaker::new(
            "hpc",
            CircuitBreakerConfig {
                failure_threshold: 2,
                timeout: Duration::from_secs(10),
            },
        );
        let calls = AtomicU32::new(0);

        assert!(fail(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(fail(&cb, &calls).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(matches!(succeed(&cb, &calls).await, Err(MqiError::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_count_while_closed() {
        let cb = breaker();
        let calls = AtomicU32::new(0);
        let _ = fail(&cb, &calls).await;
        let _ = fail(&cb, &calls).await;
        assert!(succeed(&cb, &calls).await.is_ok());
        assert_eq!(cb.failure_count(), 0);
        let _ = fail(&cb, &calls).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
