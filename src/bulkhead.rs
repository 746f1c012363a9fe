//! Bulkhead: bounds concurrent in-flight calls against one dependency.
//!
//! Admission goes through a tokio [`Semaphore`] with `max_concurrent` permits.
//! - `max_wait == 0`: a full bulkhead rejects immediately with `BulkheadFull`.
//! - `max_wait > 0`: callers queue for a slot up to `max_wait`, then get `BulkheadTimeout`.
//!
//! The slot is released when the call finishes, fails, panics, or is dropped. The
//! `active`/`waiting` counters are bookkeeping for observability only and may briefly disagree
//! with the semaphore.

pub mod thread_pool;

use crate::context::CallContext;
use crate::error::ResilienceError;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

pub type BulkheadHook = Arc<dyn Fn(&str) + Send + Sync>;

const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Bulkhead settings: 10 concurrent calls, no waiting.
#[derive(Clone)]
pub struct BulkheadConfig {
    pub(crate) name: String,
    pub(crate) max_concurrent: usize,
    pub(crate) max_wait: Duration,
    pub(crate) on_full: Option<BulkheadHook>,
    pub(crate) on_acquire: Option<BulkheadHook>,
    pub(crate) on_release: Option<BulkheadHook>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_wait: Duration::ZERO,
            on_full: None,
            on_acquire: None,
            on_release: None,
        }
    }
}

impl fmt::Debug for BulkheadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadConfig")
            .field("name", &self.name)
            .field("max_concurrent", &self.max_concurrent)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl BulkheadConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Zero falls back to the default of 10.
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Zero means reject immediately when full.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Fired on every rejection, immediate or after waiting.
    pub fn on_full<F: Fn(&str) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_full = Some(Arc::new(hook));
        self
    }

    pub fn on_acquire<F: Fn(&str) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_acquire = Some(Arc::new(hook));
        self
    }

    pub fn on_release<F: Fn(&str) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_release = Some(Arc::new(hook));
        self
    }
}

#[derive(Debug, Default)]
struct Occupancy {
    active: usize,
    waiting: usize,
}

/// Concurrency limiter. Share it through an `Arc`.
pub struct Bulkhead {
    name: Arc<str>,
    max_concurrent: usize,
    max_wait: Duration,
    semaphore: Semaphore,
    occupancy: Mutex<Occupancy>,
    on_full: Option<BulkheadHook>,
    on_acquire: Option<BulkheadHook>,
    on_release: Option<BulkheadHook>,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("max_concurrent", &self.max_concurrent)
            .field("max_wait", &self.max_wait)
            .field("available", &self.semaphore.available_permits())
            .finish()
    }
}

/// Held for the duration of an admitted call.
struct Slot<'a> {
    bulkhead: &'a Bulkhead,
    _permit: SemaphorePermit<'a>,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let bulkhead = self.bulkhead;
        {
            let mut occupancy = bulkhead.occupancy();
            occupancy.active = occupancy.active.saturating_sub(1);
        }
        if let Some(hook) = &bulkhead.on_release {
            hook(&bulkhead.name);
        }
    }
}

/// Keeps the waiting counter honest when an acquire future is dropped mid-wait.
struct Waiting<'a>(&'a Bulkhead);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let mut occupancy = self.0.occupancy();
        occupancy.waiting = occupancy.waiting.saturating_sub(1);
    }
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        let max_concurrent = if config.max_concurrent == 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            config.max_concurrent.min(Semaphore::MAX_PERMITS)
        };
        Self {
            name: Arc::from(config.name),
            max_concurrent,
            max_wait: config.max_wait,
            semaphore: Semaphore::new(max_concurrent),
            occupancy: Mutex::new(Occupancy::default()),
            on_full: config.on_full,
            on_acquire: config.on_acquire,
            on_release: config.on_release,
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(BulkheadConfig::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run `op` once a slot is available.
    ///
    /// # Errors
    /// `BulkheadFull` (non-blocking mode) or `BulkheadTimeout` (waiting mode) when no slot was
    /// obtained; `op` is not invoked.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let _slot = self.acquire(&CallContext::background()).await?;
        op().await
    }

    /// Like [`execute`](Self::execute), but waiting for a slot also ends when `ctx` is done.
    pub async fn execute_with_context<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let _slot = self.acquire(ctx).await?;
        op(ctx.clone()).await
    }

    pub fn active_count(&self) -> usize {
        self.occupancy().active
    }

    pub fn waiting_count(&self) -> usize {
        self.occupancy().waiting
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.active_count())
    }

    async fn acquire<E>(&self, ctx: &CallContext) -> Result<Slot<'_>, ResilienceError<E>> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        if self.max_wait.is_zero() {
            return match self.semaphore.try_acquire() {
                Ok(permit) => Ok(self.admit(permit)),
                Err(_) => {
                    debug!(bulkhead = %self.name, max_concurrent = self.max_concurrent, "bulkhead full");
                    self.fire_full();
                    Err(ResilienceError::BulkheadFull {
                        name: self.name.clone(),
                        max_concurrent: self.max_concurrent,
                    })
                }
            };
        }

        self.occupancy().waiting += 1;
        let _waiting = Waiting(self);

        let wait = tokio::time::timeout(self.max_wait, self.semaphore.acquire());
        let outcome = tokio::select! {
            biased;
            done = ctx.done() => return Err(done.into()),
            outcome = wait => outcome,
        };

        match outcome {
            Ok(Ok(permit)) => Ok(self.admit(permit)),
            // The semaphore is never closed, so only the timeout lands here.
            Ok(Err(_)) | Err(_) => {
                debug!(bulkhead = %self.name, waited = ?self.max_wait, "bulkhead wait timed out");
                self.fire_full();
                Err(ResilienceError::BulkheadTimeout { name: self.name.clone(), waited: self.max_wait })
            }
        }
    }

    fn admit<'a>(&'a self, permit: SemaphorePermit<'a>) -> Slot<'a> {
        self.occupancy().active += 1;
        if let Some(hook) = &self.on_acquire {
            hook(&self.name);
        }
        Slot { bulkhead: self, _permit: permit }
    }

    fn fire_full(&self) {
        if let Some(hook) = &self.on_full {
            hook(&self.name);
        }
    }

    fn occupancy(&self) -> MutexGuard<'_, Occupancy> {
        self.occupancy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Get-or-create cache of bulkheads keyed by dependency name.
#[derive(Debug, Default)]
pub struct BulkheadRegistry {
    bulkheads: RwLock<HashMap<String, Arc<Bulkhead>>>,
    config: BulkheadConfig,
}

impl BulkheadRegistry {
    /// Bulkheads created by [`get`](Self::get) use `config` with the name substituted.
    pub fn new(config: BulkheadConfig) -> Self {
        Self { bulkheads: RwLock::new(HashMap::new()), config }
    }

    pub fn get(&self, name: &str) -> Arc<Bulkhead> {
        if let Some(bulkhead) =
            self.bulkheads.read().unwrap_or_else(PoisonError::into_inner).get(name)
        {
            return bulkhead.clone();
        }

        let mut bulkheads = self.bulkheads.write().unwrap_or_else(PoisonError::into_inner);
        bulkheads
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(self.config.clone().name(name))))
            .clone()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.write().unwrap_or_else(PoisonError::into_inner).remove(name)
    }

    pub fn list(&self) -> HashMap<String, Arc<Bulkhead>> {
        self.bulkheads.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
