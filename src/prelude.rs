//! Convenient re-exports for common steadfast types.
pub use crate::{
    backoff::{BackoffStrategy, ExponentialBackoff},
    bulkhead::{Bulkhead, BulkheadConfig},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    context::CallContext,
    decorator::{ResilienceConfig, ResilienceDecorator},
    error::{ResilienceError, RetryError},
    layer::ResilienceLayer,
    rate_limit::{RateLimiter, RateLimiterConfig},
    retry::{RetryConfig, Retryer},
};
