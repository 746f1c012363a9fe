//! Retry engine for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - The caller's [`CallContext`] is checked before every attempt; a done context returns
//!   `Cancelled`/`DeadlineExceeded` directly instead of a [`RetryError`].
//! - After a failure: a `Permanent` error stops immediately, then the `do_not_retry_on`
//!   classifiers are consulted, then `retry_on` (an empty allow-list retries everything).
//! - The wait before the next attempt is `backoff.next_delay(attempt)` (zero-based index of the
//!   attempt that failed), then jittered. The wait races the context.
//! - Terminal failures are `ResilienceError::Retry` carrying every attempt's error.
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - The backoff strategy is reset after a successful attempt.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use steadfast::{CallContext, ResilienceError, Retryer, InstantSleeper};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retryer = Retryer::<MyErr>::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(100))
//!     .do_not_retry_on(ResilienceError::is_circuit_open)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result = retryer
//!     .run(&CallContext::background(), |_ctx| async { Err(ResilienceError::Inner(MyErr)) })
//!     .await;
//! assert_eq!(result.unwrap_err().retry_error().map(|r| r.attempts()), Some(3));
//! # });
//! ```

use crate::backoff::{BackoffStrategy, ExponentialBackoff};
use crate::context::CallContext;
use crate::error::{ConfigError, ResilienceError, RetryError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error classifier used by the retry allow/deny lists.
pub type Classifier<E> = Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>;

/// Plain-data retry settings. `Default` carries the documented defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    /// Upper clamp on the un-jittered delay. Zero retries immediately; a value below
    /// `initial_delay` pins every wait at `max_delay`.
    pub max_delay: Duration,
    /// Any finite value `>= 0`. Below 1 the delay shrinks between attempts.
    pub multiplier: f64,
    /// Fraction in `[0, 1]`; the delay is randomized by `± jitter * delay`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule().map(|_| ())
    }

    fn schedule(&self) -> Result<(ExponentialBackoff, Jitter), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::MustBePositive { field: "max_attempts" });
        }
        let backoff = ExponentialBackoff::new(self.initial_delay, self.max_delay, self.multiplier)?;
        let jitter = Jitter::proportional(self.jitter)?;
        Ok((backoff, jitter))
    }
}

/// Retries an operation according to a backoff schedule and a retry-eligibility policy.
pub struct Retryer<E> {
    max_attempts: usize,
    backoff: Arc<dyn BackoffStrategy>,
    jitter: Jitter,
    retry_on: Vec<Classifier<E>>,
    do_not_retry_on: Vec<Classifier<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for Retryer<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            retry_on: self.retry_on.clone(),
            do_not_retry_on: self.do_not_retry_on.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> fmt::Debug for Retryer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retryer")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.len())
            .field("do_not_retry_on", &self.do_not_retry_on.len())
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<E> Default for Retryer<E> {
    /// 3 attempts, 1s doubling up to 30s, ±20% jitter, every error retried.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Arc::new(ExponentialBackoff::default()),
            jitter: Jitter::Proportional(0.2),
            retry_on: Vec::new(),
            do_not_retry_on: Vec::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl<E> Retryer<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryBuilder<E> {
        RetryBuilder::new()
    }

    /// Build from plain settings with no classifiers.
    pub fn from_config(config: RetryConfig) -> Result<Self, ConfigError> {
        RetryBuilder::new().config(config).build()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<F, Fut>(&self, ctx: &CallContext, op: F) -> Result<(), ResilienceError<E>>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<(), ResilienceError<E>>>,
    {
        self.run_with_result(ctx, op).await
    }

    /// Value-returning variant of [`run`](Self::run).
    pub async fn run_with_result<T, F, Fut>(
        &self,
        ctx: &CallContext,
        mut op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let mut errors = Vec::new();

        for attempt in 0..self.max_attempts {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }

            let err = match op(ctx.clone()).await {
                Ok(value) => {
                    self.backoff.reset();
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retryable = self.should_retry(&err);
            debug!(attempt = attempt + 1, max_attempts = self.max_attempts, retryable, error = %err, "attempt failed");
            errors.push(err);

            if !retryable {
                return Err(ResilienceError::Retry(RetryError::new(attempt + 1, errors)));
            }
            if attempt + 1 == self.max_attempts {
                break;
            }

            let delay = self.delay_for(attempt);
            tokio::select! {
                biased;
                done = ctx.done() => return Err(done.into()),
                _ = self.sleeper.sleep(delay) => {}
            }
        }

        Err(ResilienceError::Retry(RetryError::new(self.max_attempts, errors)))
    }

    /// [`run_with_result`](Self::run_with_result) under a background context.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run_with_result(&CallContext::background(), |_| op()).await
    }

    /// Same as [`run_with_result`](Self::run_with_result); uniform entry point across primitives.
    pub async fn execute_with_context<T, F, Fut>(
        &self,
        ctx: &CallContext,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run_with_result(ctx, op).await
    }

    fn should_retry(&self, err: &ResilienceError<E>) -> bool {
        if err.is_permanent() {
            return false;
        }
        if self.do_not_retry_on.iter().any(|deny| deny(err)) {
            return false;
        }
        if self.retry_on.is_empty() {
            return true;
        }
        self.retry_on.iter().any(|allow| allow(err))
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.backoff.next_delay(attempt))
    }
}

/// Builder for [`Retryer`].
pub struct RetryBuilder<E> {
    config: RetryConfig,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    jitter: Option<Jitter>,
    retry_on: Vec<Classifier<E>>,
    do_not_retry_on: Vec<Classifier<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
            backoff: None,
            jitter: None,
            retry_on: Vec::new(),
            do_not_retry_on: Vec::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace every scalar setting at once.
    pub fn config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    /// Proportional jitter fraction in `[0, 1]`.
    pub fn jitter(mut self, fraction: f64) -> Self {
        self.config.jitter = fraction;
        self.jitter = None;
        self
    }

    /// Use any jitter shape instead of the proportional one.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Replace the built-in exponential schedule. Jitter still applies on top; pair
    /// self-randomizing strategies with `with_jitter(Jitter::None)`.
    pub fn backoff<B>(mut self, strategy: B) -> Self
    where
        B: BackoffStrategy + 'static,
    {
        self.backoff = Some(Arc::new(strategy));
        self
    }

    /// Retry only errors matching one of these classifiers (called repeatedly, the list grows).
    pub fn retry_on<P>(mut self, classifier: P) -> Self
    where
        P: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.retry_on.push(Arc::new(classifier));
        self
    }

    /// Never retry errors matching this classifier. Checked before `retry_on`.
    pub fn do_not_retry_on<P>(mut self, classifier: P) -> Self
    where
        P: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
    {
        self.do_not_retry_on.push(Arc::new(classifier));
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Build the retryer, validating inputs.
    pub fn build(self) -> Result<Retryer<E>, ConfigError> {
        let (exponential, proportional) = self.config.schedule()?;
        let backoff: Arc<dyn BackoffStrategy> = match self.backoff {
            Some(strategy) => strategy,
            None => Arc::new(exponential),
        };
        Ok(Retryer {
            max_attempts: self.config.max_attempts,
            backoff,
            jitter: self.jitter.unwrap_or(proportional),
            retry_on: self.retry_on,
            do_not_retry_on: self.do_not_retry_on,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Run `op` with the default retry policy.
pub async fn retry<E, F, Fut>(ctx: &CallContext, op: F) -> Result<(), ResilienceError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(CallContext) -> Fut,
    Fut: Future<Output = Result<(), ResilienceError<E>>>,
{
    Retryer::default().run(ctx, op).await
}

/// Run `op` with the default policy but `attempts` total attempts. Zero attempts never
/// invokes `op` and yields an empty [`RetryError`].
pub async fn retry_n<E, F, Fut>(
    ctx: &CallContext,
    attempts: usize,
    op: F,
) -> Result<(), ResilienceError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(CallContext) -> Fut,
    Fut: Future<Output = Result<(), ResilienceError<E>>>,
{
    let retryer = Retryer { max_attempts: attempts, ..Retryer::default() };
    retryer.run(ctx, op).await
}

/// Retry with a caller-owned strategy and no jitter; only the permanent marker stops early.
/// The strategy is reset after a success.
pub async fn retry_with_backoff<E, F, Fut>(
    ctx: &CallContext,
    strategy: Arc<dyn BackoffStrategy>,
    max_attempts: usize,
    op: F,
) -> Result<(), ResilienceError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(CallContext) -> Fut,
    Fut: Future<Output = Result<(), ResilienceError<E>>>,
{
    let retryer =
        Retryer { max_attempts, backoff: strategy, jitter: Jitter::None, ..Retryer::default() };
    retryer.run(ctx, op).await
}
