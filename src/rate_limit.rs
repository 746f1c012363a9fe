//! Token-bucket rate limiting.
//!
//! The bucket starts full (`burst` tokens) and refills continuously at `rate` tokens per second,
//! never above `burst`. Every admitted operation spends one token. Refill is computed lazily
//! from the elapsed [`Clock`] time whenever the bucket is inspected.

use crate::clock::{Clock, MonotonicClock};
use crate::context::CallContext;
use crate::error::ResilienceError;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

const DEFAULT_RATE: u32 = 10;

/// Outcome of a non-blocking acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A token was spent; `remaining` whole tokens are left.
    Allowed { remaining: u32 },
    /// No token available; one will be after `wait`.
    Denied { wait: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Limiter settings: 10 tokens/s with a burst equal to the rate.
#[derive(Clone)]
pub struct RateLimiterConfig {
    pub(crate) name: String,
    pub(crate) rate: u32,
    pub(crate) burst: u32,
    pub(crate) clock: Option<Arc<dyn Clock>>,
    pub(crate) sleeper: Option<Arc<dyn Sleeper>>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { name: String::new(), rate: DEFAULT_RATE, burst: 0, clock: None, sleeper: None }
    }
}

impl fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("name", &self.name)
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl RateLimiterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Tokens per second. Zero falls back to 10.
    pub fn rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Bucket capacity. Zero means "same as the rate".
    pub fn burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Used between polls in [`RateLimiter::wait`].
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Duration,
}

pub struct RateLimiter {
    name: Arc<str>,
    rate: u32,
    burst: u32,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let rate = if config.rate == 0 { DEFAULT_RATE } else { config.rate };
        let burst = if config.burst == 0 { rate } else { config.burst };
        let clock: Arc<dyn Clock> = match config.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock::default()),
        };
        let sleeper: Arc<dyn Sleeper> = match config.sleeper {
            Some(sleeper) => sleeper,
            None => Arc::new(TokioSleeper),
        };

        Self {
            name: Arc::from(config.name),
            rate,
            burst,
            bucket: Mutex::new(Bucket { tokens: f64::from(burst), last_update: clock.now() }),
            clock,
            sleeper,
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(RateLimiterConfig::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Spend a token if one is available.
    pub fn allow(&self) -> bool {
        self.try_acquire().is_allowed()
    }

    /// Like [`allow`](Self::allow), but reports the remaining balance or the time until the
    /// next token.
    pub fn try_acquire(&self) -> Decision {
        let mut bucket = self.refilled();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision::Allowed { remaining: bucket.tokens.floor() as u32 }
        } else {
            let missing = 1.0 - bucket.tokens;
            Decision::Denied { wait: Duration::from_secs_f64(missing / f64::from(self.rate)) }
        }
    }

    /// Current (fractional) balance after refill.
    pub fn tokens(&self) -> f64 {
        self.refilled().tokens
    }

    /// Wait until a token is available, polling every `1/rate` seconds.
    ///
    /// # Errors
    /// `Cancelled` or `DeadlineExceeded` when `ctx` ends first; no token is spent.
    pub async fn wait<E>(&self, ctx: &CallContext) -> Result<(), ResilienceError<E>> {
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.rate));
        loop {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }
            if self.allow() {
                return Ok(());
            }

            debug!(limiter = %self.name, interval = ?interval, "rate limited; waiting for a token");
            tokio::select! {
                biased;
                done = ctx.done() => return Err(done.into()),
                _ = self.sleeper.sleep(interval) => {}
            }
        }
    }

    /// [`wait`](Self::wait) for a token, then run `op`.
    pub async fn execute<T, E, F, Fut>(&self, ctx: &CallContext, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.wait(ctx).await?;
        op(ctx.clone()).await
    }

    /// Run `op` only if a token is available right now.
    ///
    /// # Errors
    /// `RateLimited` with the time until the next token; `op` is not invoked.
    pub async fn try_execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match self.try_acquire() {
            Decision::Allowed { .. } => op().await,
            Decision::Denied { wait } => {
                debug!(limiter = %self.name, retry_after = ?wait, "rate limited");
                Err(ResilienceError::RateLimited { name: self.name.clone(), retry_after: wait })
            }
        }
    }

    fn refilled(&self) -> MutexGuard<'_, Bucket> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let elapsed = now.saturating_sub(bucket.last_update);
        bucket.last_update = now;
        bucket.tokens =
            (bucket.tokens + f64::from(self.rate) * elapsed.as_secs_f64()).min(f64::from(self.burst));
        bucket
    }
}
