mod common;

use common::UpstreamError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steadfast::{CallContext, ResilienceError, ThreadPoolBulkhead, ThreadPoolConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_runs_more_than_max_workers_at_once() {
    let pool = Arc::new(ThreadPoolBulkhead::new(
        ThreadPoolConfig::new("exports").max_workers(3).max_queue(64),
    ));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let waits: Vec<_> = (0..24)
        .map(|i| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                pool.submit_wait(&CallContext::background(), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<UpstreamError>>(i)
                })
                .await
            })
        })
        .collect();

    let mut total = 0;
    for wait in futures::future::join_all(waits).await {
        total += wait.expect("join").expect("task result");
    }

    assert_eq!(total, (0..24).sum::<i32>());
    assert!(peak.load(Ordering::SeqCst) <= 3);
    pool.stop().await;
    assert_eq!(pool.active_count(), 0);
}

#[tokio::test]
async fn submit_after_stop_reports_pool_stopped() {
    let pool = ThreadPoolBulkhead::new(ThreadPoolConfig::new("exports"));
    pool.stop().await;

    let err = pool
        .submit_wait(&CallContext::background(), async { Ok::<_, ResilienceError<UpstreamError>>(()) })
        .await
        .unwrap_err();

    assert!(err.is_pool_stopped());
    assert!(err.to_string().contains("exports"));
}
