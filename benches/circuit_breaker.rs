use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fmt;
use std::sync::Arc;
use steadfast::{
    CircuitBreaker, CircuitBreakerConfig, InstantSleeper, ResilienceDecorator, ResilienceError,
    Retryer,
};

#[derive(Debug)]
struct BenchError;

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bench error")
    }
}

impl std::error::Error for BenchError {}

fn closed_breaker_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new("bench").trip_after(10)));

    c.bench_function("circuit_breaker_closed_success", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = breaker.clone();
            async move {
                let result = breaker
                    .execute(|| async { Ok::<_, ResilienceError<BenchError>>(black_box(1u32)) })
                    .await;
                black_box(result)
            }
        });
    });
}

fn open_breaker_rejection(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::new("bench").trip_after(1)));
    rt.block_on(async {
        let _ = breaker
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(BenchError)) })
            .await;
    });

    c.bench_function("circuit_breaker_open_rejection", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = breaker.clone();
            async move {
                let result =
                    breaker.execute(|| async { Ok::<_, ResilienceError<BenchError>>(()) }).await;
                black_box(result)
            }
        });
    });
}

fn full_decorator_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let decorator = rt.block_on(async {
        Arc::new(
            ResilienceDecorator::<BenchError>::builder()
                .retryer(Retryer::builder().with_sleeper(InstantSleeper).build().unwrap())
                .bulkhead_config(steadfast::BulkheadConfig::new("bench").max_concurrent(64))
                .circuit_breaker_config(CircuitBreakerConfig::new("bench"))
                .build()
                .unwrap(),
        )
    });

    c.bench_function("decorator_retry_bulkhead_breaker_success", |b| {
        b.to_async(&rt).iter(|| {
            let decorator = decorator.clone();
            async move {
                let result = decorator
                    .execute(|| async { Ok::<_, ResilienceError<BenchError>>(black_box(1u32)) })
                    .await;
                black_box(result)
            }
        });
    });
}

criterion_group!(benches, closed_breaker_success, open_breaker_rejection, full_decorator_success);
criterion_main!(benches);
