mod common;

use common::UpstreamError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use steadfast::{
    CircuitBreakerConfig, InstantSleeper, ManualClock, ResilienceDecorator, ResilienceError,
    ResilienceLayer, Retryer,
};
use tower::{service_fn, Layer, ServiceBuilder, ServiceExt};

fn decorator(attempts: usize, trip_after: u32) -> ResilienceDecorator<UpstreamError> {
    ResilienceDecorator::builder()
        .retryer(
            Retryer::builder()
                .max_attempts(attempts)
                .jitter(0.0)
                .with_sleeper(InstantSleeper)
                .build()
                .unwrap(),
        )
        .circuit_breaker_config(
            CircuitBreakerConfig::new("lookup").trip_after(trip_after).clock(ManualClock::new()),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn retries_requests_until_the_service_succeeds() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let inner = service_fn(move |id: u32| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(UpstreamError("timeout"))
            } else {
                Ok(format!("lead-{id}"))
            }
        }
    });

    let svc = ServiceBuilder::new().layer(ResilienceLayer::new(decorator(3, 10))).service(inner);
    let response = svc.oneshot(7).await.unwrap();

    assert_eq!(response, "lead-7");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn inner_errors_are_wrapped_and_breaker_engages() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let inner = service_fn(move |_req: &'static str| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(UpstreamError("down")) }
    });

    let svc = ResilienceLayer::new(decorator(4, 2)).layer(inner);
    let err = svc.oneshot("lookup").await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let retry = err.retry_error().expect("retry error");
    assert_eq!(retry.attempts(), 4);
    assert_eq!(retry.errors()[0].as_inner(), Some(&UpstreamError("down")));
    assert!(retry.errors()[3].is_circuit_open());
    assert!(matches!(retry.errors()[1], ResilienceError::Inner(_)));
}
