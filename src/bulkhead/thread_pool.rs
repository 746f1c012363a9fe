//! Worker-pool bulkhead: a fixed set of workers draining a bounded task queue.
//!
//! Submission never blocks. A full queue rejects with `BulkheadFull`, and a stopped pool
//! rejects with `PoolStopped`. Workers are Tokio tasks, so [`ThreadPoolBulkhead::new`] must be
//! called from inside a runtime.

use crate::context::CallContext;
use crate::error::ResilienceError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub(crate) name: String,
    pub(crate) max_workers: usize,
    pub(crate) max_queue: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self { name: String::new(), max_workers: 10, max_queue: 100 }
    }
}

impl ThreadPoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Zero falls back to 10.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Zero falls back to 100.
    pub fn max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }
}

#[derive(Debug, Default)]
struct Gauges {
    active: AtomicUsize,
    queued: AtomicUsize,
}

#[derive(Debug)]
pub struct ThreadPoolBulkhead {
    name: Arc<str>,
    max_workers: usize,
    intake: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    gauges: Arc<Gauges>,
}

impl ThreadPoolBulkhead {
    /// Spawn `max_workers` workers.
    ///
    /// # Panics
    /// When called outside a Tokio runtime.
    pub fn new(config: ThreadPoolConfig) -> Self {
        let max_workers = if config.max_workers == 0 { 10 } else { config.max_workers };
        let max_queue = if config.max_queue == 0 { 100 } else { config.max_queue };
        let name: Arc<str> = Arc::from(config.name);

        let (tx, rx) = mpsc::channel::<Job>(max_queue);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let gauges = Arc::new(Gauges::default());

        let workers = (0..max_workers)
            .map(|id| tokio::spawn(work(id, name.clone(), rx.clone(), gauges.clone())))
            .collect();

        Self {
            name,
            max_workers,
            intake: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            gauges,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `task` without waiting for it. A panicking task is logged and the worker carries on.
    ///
    /// # Errors
    /// `PoolStopped` after [`stop`](Self::stop); `BulkheadFull` when the queue is full.
    pub fn submit<E, F>(&self, task: F) -> Result<(), ResilienceError<E>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(task.boxed())
    }

    /// Queue `task` and wait for its result, or until `ctx` is done.
    ///
    /// The task keeps running if `ctx` ends first. A panic inside the task resumes in the
    /// caller.
    pub async fn submit_wait<T, E, F>(
        &self,
        ctx: &CallContext,
        task: F,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(
            async move {
                let outcome = AssertUnwindSafe(task).catch_unwind().await;
                let _ = tx.send(outcome);
            }
            .boxed(),
        )?;

        tokio::select! {
            biased;
            done = ctx.done() => Err(done.into()),
            outcome = rx => match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => panic::resume_unwind(payload),
                // The job was dropped unrun: its worker was cancelled, which only happens
                // when the runtime shuts down underneath the pool.
                Err(_) => Err(ResilienceError::PoolStopped { name: self.name.clone() }),
            },
        }
    }

    /// Close the queue, let workers finish what is already queued, and wait for them.
    /// Later calls are no-ops.
    pub async fn stop(&self) {
        drop(self.intake().take());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(pool = %self.name, error = %err, "worker exited abnormally");
            }
        }
    }

    /// Tasks currently running.
    pub fn active_count(&self) -> usize {
        self.gauges.active.load(Ordering::SeqCst)
    }

    /// Tasks accepted but not yet picked up.
    pub fn queued_count(&self) -> usize {
        self.gauges.queued.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.intake().is_none()
    }

    fn enqueue<E>(&self, job: Job) -> Result<(), ResilienceError<E>> {
        let intake = self.intake();
        let Some(tx) = intake.as_ref() else {
            return Err(ResilienceError::PoolStopped { name: self.name.clone() });
        };

        self.gauges.queued.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.gauges.queued.fetch_sub(1, Ordering::SeqCst);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        debug!(pool = %self.name, "task queue full");
                        Err(ResilienceError::BulkheadFull {
                            name: self.name.clone(),
                            max_concurrent: self.max_workers,
                        })
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        Err(ResilienceError::PoolStopped { name: self.name.clone() })
                    }
                }
            }
        }
    }

    fn intake(&self) -> MutexGuard<'_, Option<mpsc::Sender<Job>>> {
        self.intake.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn work(
    id: usize,
    pool: Arc<str>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    gauges: Arc<Gauges>,
) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            debug!(pool = %pool, worker = id, "worker exiting");
            return;
        };

        gauges.queued.fetch_sub(1, Ordering::SeqCst);
        gauges.active.fetch_add(1, Ordering::SeqCst);
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            warn!(pool = %pool, worker = id, "task panicked");
        }
        gauges.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::time::Duration;

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error")
        }
    }

    impl std::error::Error for TestError {}

    type Outcome = Result<(), ResilienceError<TestError>>;

    #[tokio::test]
    async fn submit_wait_returns_task_result() {
        let pool = ThreadPoolBulkhead::new(ThreadPoolConfig::new("io").max_workers(2));
        let ctx = CallContext::background();

        let value = pool
            .submit_wait(&ctx, async { Ok::<_, ResilienceError<TestError>>(21 * 2) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let err = pool
            .submit_wait(&ctx, async { Err::<(), _>(ResilienceError::Inner(TestError)) })
            .await
            .unwrap_err();
        assert!(err.is_inner());
        pool.stop().await;
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let pool = ThreadPoolBulkhead::new(ThreadPoolConfig::new("io").max_workers(1).max_queue(1));
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first: Outcome = pool.submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        });
        assert!(first.is_ok());
        started_rx.await.expect("worker picked up the task");
        assert_eq!(pool.active_count(), 1);

        let queued: Outcome = pool.submit(async {});
        assert!(queued.is_ok());
        assert_eq!(pool.queued_count(), 1);

        let rejected: Outcome = pool.submit(async {});
        assert!(rejected.unwrap_err().is_bulkhead_full());

        let _ = release_tx.send(());
        pool.stop().await;
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.queued_count(), 0);
    }

    #[tokio::test]
    async fn stop_drains_queue_then_rejects() {
        let pool = ThreadPoolBulkhead::new(ThreadPoolConfig::new("io").max_workers(1));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = done.clone();
            let submitted: Outcome = pool.submit(async move {
                done.fetch_add(1, Ordering::SeqCst);
            });
            assert!(submitted.is_ok());
        }

        pool.stop().await;

        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert!(pool.is_stopped());
        let after: Outcome = pool.submit(async {});
        assert!(after.unwrap_err().is_pool_stopped());
        pool.stop().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_worker() {
        let pool = ThreadPoolBulkhead::new(ThreadPoolConfig::new("io").max_workers(1));
        let boom: Outcome = pool.submit(async { panic!("boom") });
        assert!(boom.is_ok());

        let value = pool
            .submit_wait(&CallContext::background(), async {
                Ok::<_, ResilienceError<TestError>>("still alive")
            })
            .await
            .unwrap();
        assert_eq!(value, "still alive");
        pool.stop().await;
    }

    #[tokio::test]
    async fn submit_wait_reports_stopped_when_job_is_dropped_unrun() {
        let pool = Arc::new(ThreadPoolBulkhead::new(ThreadPoolConfig::new("io").max_workers(1)));
        let (started_tx, started_rx) = oneshot::channel();
        let blocker: Outcome = pool.submit(async move {
            let _ = started_tx.send(());
            futures::future::pending::<()>().await;
        });
        assert!(blocker.is_ok());
        started_rx.await.expect("worker picked up the task");

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move {
                pool.submit_wait(&CallContext::background(), async {
                    Ok::<_, ResilienceError<TestError>>(1)
                })
                .await
            }
        });
        while pool.queued_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Cancelled workers drop the queue receiver and every job still in it.
        for worker in pool.workers.lock().unwrap().drain(..) {
            worker.abort();
        }

        let err = waiter.await.expect("waiter task").unwrap_err();
        assert!(err.is_pool_stopped());
        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submit_wait_gives_up_at_deadline() {
        let pool = ThreadPoolBulkhead::new(ThreadPoolConfig::new("io").max_workers(1));
        let ctx = CallContext::background().with_timeout(Duration::from_millis(50));

        let err = pool
            .submit_wait(&ctx, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_deadline_exceeded());
    }
}
