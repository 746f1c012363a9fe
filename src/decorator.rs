//! One call path through every configured resilience layer.
//!
//! Nesting, outermost first: Retry → Rate Limiter → Bulkhead → Circuit Breaker → operation.
//! Every retry attempt re-enters the limiter, the bulkhead and the breaker, so an attempt
//! against an open circuit fails fast instead of reaching the operation. Layers that are not
//! configured are skipped.

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::context::CallContext;
use crate::error::{ConfigError, ResilienceError};
use crate::rate_limit::{RateLimiter, RateLimiterConfig};
use crate::retry::{RetryConfig, Retryer};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Which layers to build. `None` leaves a layer out.
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub retry: Option<RetryConfig>,
    pub rate_limiter: Option<RateLimiterConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

pub struct ResilienceDecorator<E> {
    retryer: Option<Retryer<E>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    bulkhead: Option<Arc<Bulkhead>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl<E> Clone for ResilienceDecorator<E> {
    fn clone(&self) -> Self {
        Self {
            retryer: self.retryer.clone(),
            rate_limiter: self.rate_limiter.clone(),
            bulkhead: self.bulkhead.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
        }
    }
}

impl<E> fmt::Debug for ResilienceDecorator<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceDecorator")
            .field("retryer", &self.retryer)
            .field("rate_limiter", &self.rate_limiter)
            .field("bulkhead", &self.bulkhead)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

impl<E> ResilienceDecorator<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Build fresh, unshared layers from `config`.
    ///
    /// # Errors
    /// When the retry settings are invalid.
    pub fn new(config: ResilienceConfig) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Some(retry) = config.retry {
            builder = builder.retry_config(retry);
        }
        if let Some(limiter) = config.rate_limiter {
            builder = builder.rate_limiter_config(limiter);
        }
        if let Some(bulkhead) = config.bulkhead {
            builder = builder.bulkhead_config(bulkhead);
        }
        if let Some(breaker) = config.circuit_breaker {
            builder = builder.circuit_breaker_config(breaker);
        }
        builder.build()
    }

    pub fn builder() -> ResilienceDecoratorBuilder<E> {
        ResilienceDecoratorBuilder::default()
    }

    /// [`execute_with_context`](Self::execute_with_context) under a background context.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.execute_with_context(&CallContext::background(), |_| op()).await
    }

    /// Run `op` through every configured layer.
    ///
    /// With a retry layer, failures come back as `ResilienceError::Retry` holding one error per
    /// attempt, including rejections raised by the inner layers. Without one, the first error
    /// is returned as is.
    pub async fn execute_with_context<T, F, Fut>(
        &self,
        ctx: &CallContext,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let op = Mutex::new(op);
        let op = &op;
        // The lock is held only while the attempt's future is created.
        let invoke = move |ctx: CallContext| {
            let mut op = op.lock().unwrap_or_else(PoisonError::into_inner);
            (*op)(ctx)
        };

        match &self.retryer {
            Some(retryer) => {
                retryer.run_with_result(ctx, |attempt| self.guarded(attempt, invoke)).await
            }
            None => self.guarded(ctx.clone(), invoke).await,
        }
    }

    pub fn retryer(&self) -> Option<&Retryer<E>> {
        self.retryer.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Arc<Bulkhead>> {
        self.bulkhead.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.circuit_breaker.as_ref()
    }

    /// One attempt: limiter, then bulkhead, then breaker, then `op`.
    async fn guarded<T, F, Fut>(&self, ctx: CallContext, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.wait(&ctx).await?;
        }

        match (&self.bulkhead, &self.circuit_breaker) {
            (Some(bulkhead), Some(breaker)) => {
                bulkhead
                    .execute_with_context(&ctx, move |ctx| async move {
                        breaker.execute_with_context(&ctx, op).await
                    })
                    .await
            }
            (Some(bulkhead), None) => bulkhead.execute_with_context(&ctx, op).await,
            (None, Some(breaker)) => breaker.execute_with_context(&ctx, op).await,
            (None, None) => op(ctx).await,
        }
    }
}

/// Assembles a [`ResilienceDecorator`] from configs or from shared instances.
///
/// Instances taken from a registry let several decorators share per-dependency state, such as
/// one breaker per downstream service.
pub struct ResilienceDecoratorBuilder<E> {
    retry_config: Option<RetryConfig>,
    retryer: Option<Retryer<E>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    bulkhead: Option<Arc<Bulkhead>>,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl<E> Default for ResilienceDecoratorBuilder<E> {
    fn default() -> Self {
        Self {
            retry_config: None,
            retryer: None,
            rate_limiter: None,
            bulkhead: None,
            circuit_breaker: None,
        }
    }
}

impl<E> ResilienceDecoratorBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self.retryer = None;
        self
    }

    /// Use a prepared retryer, e.g. one with classifiers or a custom backoff strategy.
    pub fn retryer(mut self, retryer: Retryer<E>) -> Self {
        self.retryer = Some(retryer);
        self.retry_config = None;
        self
    }

    pub fn rate_limiter_config(self, config: RateLimiterConfig) -> Self {
        self.rate_limiter(Arc::new(RateLimiter::new(config)))
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn bulkhead_config(self, config: BulkheadConfig) -> Self {
        self.bulkhead(Arc::new(Bulkhead::new(config)))
    }

    pub fn bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn circuit_breaker_config(self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker(Arc::new(CircuitBreaker::new(config)))
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn build(self) -> Result<ResilienceDecorator<E>, ConfigError> {
        let retryer = match (self.retryer, self.retry_config) {
            (Some(retryer), _) => Some(retryer),
            (None, Some(config)) => Some(Retryer::from_config(config)?),
            (None, None) => None,
        };
        Ok(ResilienceDecorator {
            retryer,
            rate_limiter: self.rate_limiter,
            bulkhead: self.bulkhead,
            circuit_breaker: self.circuit_breaker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn instant_retryer(attempts: usize) -> Retryer<TestError> {
        Retryer::builder()
            .max_attempts(attempts)
            .jitter(0.0)
            .with_sleeper(InstantSleeper)
            .build()
            .expect("valid retry settings")
    }

    #[tokio::test]
    async fn no_layers_runs_operation_directly() {
        let decorator = ResilienceDecorator::<TestError>::new(ResilienceConfig::default()).unwrap();

        let result = decorator.execute(|| async { Ok::<_, ResilienceError<TestError>>(5) }).await;
        assert_eq!(result.unwrap(), 5);

        let err = decorator
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("x"))) })
            .await
            .unwrap_err();
        assert_eq!(err.as_inner(), Some(&TestError("x")));
    }

    #[tokio::test]
    async fn invalid_retry_config_is_rejected() {
        let config = ResilienceConfig {
            retry: Some(RetryConfig { max_attempts: 0, ..RetryConfig::default() }),
            ..ResilienceConfig::default()
        };
        assert!(ResilienceDecorator::<TestError>::new(config).is_err());
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let decorator = ResilienceDecorator::builder()
            .retryer(instant_retryer(3))
            .circuit_breaker_config(CircuitBreakerConfig::new("svc").clock(ManualClock::new()))
            .bulkhead_config(BulkheadConfig::new("svc").max_concurrent(1))
            .build()
            .unwrap();
        let calls = AtomicUsize::new(0);

        let result = decorator
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ResilienceError::Inner(TestError("flaky")))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let breaker = decorator.circuit_breaker().expect("breaker configured");
        assert_eq!(breaker.counts().total_failures, 2);
        assert_eq!(decorator.bulkhead().map(|b| b.active_count()), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_waits_for_the_rate_limiter() {
        let decorator = ResilienceDecorator::builder()
            .retryer(instant_retryer(3))
            .rate_limiter_config(RateLimiterConfig::new("svc").rate(10).burst(1))
            .build()
            .unwrap();
        let start = tokio::time::Instant::now();

        let err = decorator
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("down"))) })
            .await
            .unwrap_err();

        assert_eq!(err.retry_error().map(|r| r.attempts()), Some(3));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn shared_breaker_trips_for_every_decorator() {
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::new("payments").trip_after(1).clock(ManualClock::new()),
        ));
        let first = ResilienceDecorator::<TestError>::builder()
            .circuit_breaker(breaker.clone())
            .build()
            .unwrap();
        let second = ResilienceDecorator::<TestError>::builder()
            .circuit_breaker(breaker.clone())
            .build()
            .unwrap();

        let _ = first
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("down"))) })
            .await;

        assert_eq!(breaker.state(), CircuitState::Open);
        let err = second.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        assert!(err.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn full_bulkhead_rejects_without_calling_operation() {
        let bulkhead = Arc::new(Bulkhead::new(BulkheadConfig::new("svc").max_concurrent(1)));
        let decorator =
            ResilienceDecorator::<TestError>::builder().bulkhead(bulkhead.clone()).build().unwrap();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async move {
                        let _ = entered_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, ResilienceError<TestError>>(())
                    })
                    .await
            })
        };
        entered_rx.await.expect("holder entered");

        let calls = AtomicUsize::new(0);
        let err = decorator
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ResilienceError<TestError>>(()) }
            })
            .await
            .unwrap_err();

        assert!(err.is_bulkhead_full());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let _ = release_tx.send(());
        holder.await.expect("join").expect("holder succeeded");
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let decorator = ResilienceDecorator::builder()
            .retryer(instant_retryer(3))
            .circuit_breaker_config(CircuitBreakerConfig::new("svc"))
            .build()
            .unwrap();
        let ctx = CallContext::background();
        ctx.cancel();

        let err = decorator
            .execute_with_context(&ctx, |_| async { Ok::<_, ResilienceError<TestError>>(()) })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }
}
