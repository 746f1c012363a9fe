#![forbid(unsafe_code)]

//! # steadfast
//!
//! In-process resilience patterns for async Rust services that call flaky dependencies.
//!
//! ## Features
//!
//! - **Circuit breaker** with generations, half-open probing and pluggable trip/success
//!   predicates, plus registry, health check, per-service metrics, fallback and two-phase
//!   variants
//! - **Retryer** with exponential, linear, constant and decorrelated-jitter backoff and a
//!   permanent-error marker
//! - **Bulkhead** bounding concurrent calls, and a worker-pool bulkhead with a bounded queue
//! - **Token-bucket rate limiter**
//! - **Decorator** composing all four in a fixed order: Retry → Rate Limiter → Bulkhead →
//!   Circuit Breaker → operation, also usable as a tower `Layer`
//!
//! Every suspending call takes a [`CallContext`] (cancellation token plus optional deadline).
//! Operations report their own failures as [`ResilienceError::Inner`].
//!
//! ## Quick Start
//!
//! ```rust
//! use steadfast::{CircuitBreakerConfig, ResilienceDecorator, ResilienceError, RetryConfig};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct UpstreamError;
//! impl std::fmt::Display for UpstreamError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "upstream failed") }
//! }
//! impl std::error::Error for UpstreamError {}
//!
//! #[tokio::main]
//! async fn main() {
//!     let decorator = ResilienceDecorator::builder()
//!         .retry_config(RetryConfig { initial_delay: Duration::from_millis(10), ..RetryConfig::default() })
//!         .circuit_breaker_config(CircuitBreakerConfig::new("crm").trip_after(2))
//!         .build()
//!         .unwrap();
//!
//!     let result = decorator
//!         .execute(|| async { Err::<(), _>(ResilienceError::Inner(UpstreamError)) })
//!         .await;
//!
//!     let failure = result.unwrap_err();
//!     let attempts = failure.retry_error().map(|r| r.errors().len());
//!     assert_eq!(attempts, Some(3));
//! }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod context;
pub mod decorator;
pub mod error;
pub mod jitter;
pub mod layer;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod service_breaker;
#[cfg(feature = "serde")]
pub mod settings;
pub mod sleeper;

// Re-exports
pub use backoff::{
    BackoffStrategy, ConstantBackoff, DecorrelatedJitterBackoff, ExponentialBackoff, LinearBackoff,
};
pub use bulkhead::thread_pool::{ThreadPoolBulkhead, ThreadPoolConfig};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadRegistry};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Counts, TwoPhaseCircuitBreaker,
};
pub use circuit_breaker_registry::{CircuitBreakerHealthCheck, CircuitBreakerRegistry};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::{CallContext, ContextError};
pub use decorator::{ResilienceConfig, ResilienceDecorator, ResilienceDecoratorBuilder};
pub use error::{ConfigError, ResilienceError, RetryError};
pub use jitter::Jitter;
pub use layer::{ResilienceLayer, ResilienceService};
pub use rate_limit::{Decision, RateLimiter, RateLimiterConfig};
pub use retry::{retry, retry_n, retry_with_backoff, RetryBuilder, RetryConfig, Retryer};
pub use service_breaker::{CircuitBreakerMetrics, ServiceCircuitBreaker};
#[cfg(feature = "serde")]
pub use settings::ResilienceSettings;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
