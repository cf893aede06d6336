//! Resilience primitives wrapped around every remote and local operation

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy};
