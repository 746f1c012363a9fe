//! Error types shared by every resilience primitive.
use crate::context::ContextError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Unified error type for all resilience primitives.
///
/// Operations report their own failures as [`ResilienceError::Inner`]; every other variant is
/// produced by a primitive (a rejection, a cancellation, or retry exhaustion).
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open and short-circuited the call.
    CircuitOpen { name: Arc<str> },
    /// The guarded call did not finish within the breaker's call timeout.
    CircuitTimeout { name: Arc<str>, timeout: Duration },
    /// The half-open breaker is already running its maximum number of probes.
    TooManyRequests { name: Arc<str> },
    /// The bulkhead had no free slot and does not wait.
    BulkheadFull { name: Arc<str>, max_concurrent: usize },
    /// No bulkhead slot freed up within the configured wait.
    BulkheadTimeout { name: Arc<str>, waited: Duration },
    /// The token bucket was empty.
    RateLimited { name: Arc<str>, retry_after: Duration },
    /// The worker pool has been stopped and accepts no more tasks.
    PoolStopped { name: Arc<str> },
    /// The caller's context was cancelled.
    Cancelled,
    /// The caller's context deadline passed.
    DeadlineExceeded,
    /// An operation failure explicitly marked as non-retryable.
    Permanent(E),
    /// Terminal failure of a retry loop, with the full attempt history.
    Retry(RetryError<E>),
    /// The underlying operation failed.
    Inner(E),
}

/// Terminal failure of a retry loop.
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    attempts: usize,
    errors: Vec<ResilienceError<E>>,
}

impl<E> RetryError<E> {
    pub(crate) fn new(attempts: usize, errors: Vec<ResilienceError<E>>) -> Self {
        Self { attempts, errors }
    }

    /// Number of attempts that were made.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Every attempt's error, oldest first.
    pub fn errors(&self) -> &[ResilienceError<E>] {
        &self.errors
    }

    /// The error of the final attempt.
    pub fn last_error(&self) -> Option<&ResilienceError<E>> {
        self.errors.last()
    }

    pub fn into_errors(self) -> Vec<ResilienceError<E>> {
        self.errors
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.last() {
            Some(last) => write!(f, "failed after {} attempts: {}", self.attempts, last),
            None => write!(f, "failed after {} attempts", self.attempts),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors.last().map(|e| e as &dyn std::error::Error)
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { name } => write!(f, "circuit breaker '{}' is open", name),
            Self::CircuitTimeout { name, timeout } => {
                write!(f, "circuit breaker '{}' timeout after {:?}", name, timeout)
            }
            Self::TooManyRequests { name } => {
                write!(f, "too many requests: circuit breaker '{}' is probing", name)
            }
            Self::BulkheadFull { name, max_concurrent } => {
                write!(f, "bulkhead '{}' full ({} concurrent)", name, max_concurrent)
            }
            Self::BulkheadTimeout { name, waited } => {
                write!(f, "bulkhead '{}' timeout after waiting {:?}", name, waited)
            }
            Self::RateLimited { name, retry_after } => {
                write!(f, "rate limiter '{}' exhausted; retry after {:?}", name, retry_after)
            }
            Self::PoolStopped { name } => write!(f, "worker pool '{}' stopped", name),
            Self::Cancelled => write!(f, "{}", ContextError::Cancelled),
            Self::DeadlineExceeded => write!(f, "{}", ContextError::DeadlineExceeded),
            Self::Permanent(e) => write!(f, "permanent error: {}", e),
            Self::Retry(r) => write!(f, "{}", r),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) | Self::Permanent(e) => Some(e),
            Self::Retry(r) => r.last_error().map(|e| e as &dyn std::error::Error),
            _ => None,
        }
    }
}

impl<E> From<ContextError> for ResilienceError<E> {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Mark an operation error as non-retryable.
    pub fn permanent(err: E) -> Self {
        Self::Permanent(err)
    }

    /// Convert an `Inner` failure into a `Permanent` one; other variants are returned as-is.
    pub fn mark_permanent(self) -> Self {
        match self {
            Self::Inner(e) => Self::Permanent(e),
            other => other,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_circuit_timeout(&self) -> bool {
        matches!(self, Self::CircuitTimeout { .. })
    }

    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, Self::TooManyRequests { .. })
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    pub fn is_bulkhead_timeout(&self) -> bool {
        matches!(self, Self::BulkheadTimeout { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_pool_stopped(&self) -> bool {
        matches!(self, Self::PoolStopped { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Either cancellation flavour: the caller gave up.
    pub fn is_context_error(&self) -> bool {
        self.is_cancelled() || self.is_deadline_exceeded()
    }

    /// A breaker rejected the call without running it.
    pub fn is_breaker_rejection(&self) -> bool {
        self.is_circuit_open() || self.is_too_many_requests()
    }

    /// Any primitive rejected the call: the dependency is unhealthy or saturated.
    pub fn is_rejection(&self) -> bool {
        self.is_breaker_rejection()
            || self.is_bulkhead_full()
            || self.is_bulkhead_timeout()
            || self.is_rate_limited()
            || self.is_pool_stopped()
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Borrow the operation error of an `Inner` or `Permanent` failure.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) | Self::Permanent(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) | Self::Permanent(e) => Some(e),
            _ => None,
        }
    }

    pub fn retry_error(&self) -> Option<&RetryError<E>> {
        match self {
            Self::Retry(r) => Some(r),
            _ => None,
        }
    }

    /// Follow retry wrappers down to the error of the final attempt.
    pub fn root(&self) -> &Self {
        let mut current = self;
        while let Self::Retry(r) = current {
            match r.last_error() {
                Some(last) => current = last,
                None => break,
            }
        }
        current
    }
}

/// Invalid configuration value, reported by builders and `validate()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
    #[error("{field} out of range (got {value})")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("max delay ({max:?}) must be >= base delay ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}
