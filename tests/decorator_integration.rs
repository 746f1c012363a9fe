mod common;

use common::{fail, UpstreamError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steadfast::{
    BulkheadConfig, CallContext, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    InstantSleeper, ManualClock, RateLimiterConfig, ResilienceConfig, ResilienceDecorator,
    ResilienceError, RetryConfig, Retryer,
};

fn instant_retryer(attempts: usize) -> Retryer<UpstreamError> {
    Retryer::builder()
        .max_attempts(attempts)
        .jitter(0.0)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap()
}

#[tokio::test]
async fn retry_attempt_against_open_breaker_fails_fast() {
    let decorator = ResilienceDecorator::builder()
        .retryer(instant_retryer(3))
        .circuit_breaker_config(
            CircuitBreakerConfig::new("crm").trip_after(2).clock(ManualClock::new()),
        )
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let err = decorator
        .execute(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { fail::<()>() }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 2, "third attempt never reaches the operation");
    let retry = err.retry_error().expect("retry error");
    assert_eq!(retry.attempts(), 3);
    assert_eq!(retry.errors().len(), 3);
    assert!(retry.errors()[0].is_inner());
    assert!(retry.errors()[1].is_inner());
    assert!(retry.errors()[2].is_circuit_open());
    assert!(retry.last_error().is_some_and(ResilienceError::is_circuit_open));
    assert_eq!(
        decorator.circuit_breaker().map(|b| b.state()),
        Some(CircuitState::Open)
    );
}

#[tokio::test]
async fn do_not_retry_on_open_circuit_stops_early() {
    let retryer = Retryer::builder()
        .max_attempts(5)
        .jitter(0.0)
        .with_sleeper(InstantSleeper)
        .do_not_retry_on(ResilienceError::is_circuit_open)
        .build()
        .unwrap();
    let decorator = ResilienceDecorator::builder()
        .retryer(retryer)
        .circuit_breaker_config(
            CircuitBreakerConfig::new("crm").trip_after(1).clock(ManualClock::new()),
        )
        .build()
        .unwrap();

    let err = decorator.execute(|| async { fail::<()>() }).await.unwrap_err();

    let retry = err.retry_error().expect("retry error");
    assert_eq!(retry.attempts(), 2);
    assert!(retry.last_error().is_some_and(ResilienceError::is_circuit_open));
}

#[tokio::test]
async fn permanent_errors_are_not_retried_through_the_stack() {
    let decorator = ResilienceDecorator::builder()
        .retryer(instant_retryer(4))
        .bulkhead_config(BulkheadConfig::new("crm").max_concurrent(2))
        .circuit_breaker_config(CircuitBreakerConfig::new("crm").clock(ManualClock::new()))
        .build()
        .unwrap();
    let calls = AtomicUsize::new(0);

    let err = decorator
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ResilienceError::permanent(UpstreamError("bad request"))) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let retry = err.retry_error().expect("retry error");
    assert_eq!(retry.attempts(), 1);
    assert!(retry.errors()[0].is_permanent());
}

#[tokio::test]
async fn decorators_share_breakers_from_a_registry() {
    let registry = CircuitBreakerRegistry::new(
        CircuitBreakerConfig::default().trip_after(1).clock(ManualClock::new()),
    );
    let orders = ResilienceDecorator::<UpstreamError>::builder()
        .circuit_breaker(registry.get("inventory"))
        .build()
        .unwrap();
    let checkout = ResilienceDecorator::<UpstreamError>::builder()
        .circuit_breaker(registry.get("inventory"))
        .build()
        .unwrap();

    let _ = orders.execute(|| async { fail::<()>() }).await;

    let err = checkout.execute(|| async { Ok::<_, ResilienceError<UpstreamError>>(()) }).await;
    assert!(err.unwrap_err().is_circuit_open());
    assert_eq!(registry.get("inventory").state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn deadline_cuts_retries_short() {
    let decorator = ResilienceDecorator::<UpstreamError>::new(ResilienceConfig {
        retry: Some(RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            jitter: 0.0,
            ..RetryConfig::default()
        }),
        rate_limiter: Some(RateLimiterConfig::new("crm").rate(100)),
        ..ResilienceConfig::default()
    })
    .unwrap();
    let ctx = CallContext::background().with_timeout(Duration::from_millis(250));
    let calls = AtomicUsize::new(0);

    let err = decorator
        .execute_with_context(&ctx, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { fail::<()>() }
        })
        .await
        .unwrap_err();

    assert!(err.is_deadline_exceeded());
    // Attempts at 0ms and 100ms; the 200ms wait before the third crosses the deadline.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
