//! Circuit breaker with generation-tracked measurement windows.
//!
//! State machine:
//! - **Closed**: calls pass through. Counts accumulate over a rolling window of `interval`;
//!   `ready_to_trip` is evaluated after every failure. When the window elapses without a trip
//!   the counts reset and a new generation starts.
//! - **Open**: calls are rejected with `CircuitOpen` until `timeout` has elapsed. The first
//!   evaluation after that moves the breaker to half-open.
//! - **HalfOpen**: at most `max_requests` probes are admitted, further calls get
//!   `TooManyRequests`. `max_requests` consecutive successes close the breaker; any failure
//!   reopens it.
//!
//! State is evaluated lazily on every call; there is no background timer. Every transition or
//! window rollover bumps the generation, and a completion that started in an older generation
//! is discarded instead of touching the fresh counts.
//!
//! ```rust
//! use std::time::Duration;
//! use steadfast::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
//!
//! #[derive(Debug)]
//! struct Down;
//! impl std::fmt::Display for Down { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "down") } }
//! impl std::error::Error for Down {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("billing").trip_after(2).with_timeout(Duration::from_secs(5)),
//! );
//! for _ in 0..2 {
//!     let _ = breaker.execute(|| async { Err::<(), _>(ResilienceError::Inner(Down)) }).await;
//! }
//! let rejected = breaker.execute(|| async { Ok::<_, ResilienceError<Down>>(()) }).await;
//! assert!(rejected.unwrap_err().is_circuit_open());
//! # });
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::context::CallContext;
use crate::error::ResilienceError;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CircuitState {
    /// Normal operating mode.
    #[default]
    Closed,
    /// Short-circuits calls until the cool-down elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request tallies for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

pub type TripPredicate = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;
pub type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;
pub type SuccessPredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Breaker settings. Zero values fall back to the defaults (5 probes, 60s window,
/// 30s cool-down, trip when more than 5 consecutive failures).
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub(crate) name: String,
    pub(crate) max_requests: u32,
    pub(crate) interval: Duration,
    pub(crate) timeout: Duration,
    pub(crate) ready_to_trip: Option<TripPredicate>,
    pub(crate) on_state_change: Option<StateChangeHook>,
    pub(crate) is_successful: Option<SuccessPredicate>,
    pub(crate) clock: Option<Arc<dyn Clock>>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_requests: DEFAULT_MAX_REQUESTS,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            ready_to_trip: None,
            on_state_change: None,
            is_successful: None,
            clock: None,
        }
    }
}

const DEFAULT_MAX_REQUESTS: u32 = 5;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TRIP_THRESHOLD: u32 = 5;

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("ready_to_trip", &self.ready_to_trip.as_ref().map(|_| "<predicate>"))
            .field("on_state_change", &self.on_state_change.as_ref().map(|_| "<hook>"))
            .field("is_successful", &self.is_successful.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Probes admitted while half-open, and successes needed to close.
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Length of the closed-state measurement window.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// How long the breaker stays open before probing.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ready_to_trip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.ready_to_trip = Some(Arc::new(predicate));
        self
    }

    /// Trip once `consecutive_failures` reaches `failures`.
    pub fn trip_after(self, failures: u32) -> Self {
        self.ready_to_trip(move |counts| counts.consecutive_failures >= failures)
    }

    /// Called synchronously on every transition, with the breaker lock held. The hook must not
    /// call back into the same breaker.
    pub fn on_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Treat some operation errors as successes (e.g. an expected "not found").
    pub fn is_successful<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.is_successful = Some(Arc::new(predicate));
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Open,
    TooManyRequests,
}

/// Circuit breaker guarding calls to one dependency. Share it through an `Arc`.
pub struct CircuitBreaker {
    name: Arc<str>,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: TripPredicate,
    on_state_change: Option<StateChangeHook>,
    is_successful: Option<SuccessPredicate>,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &state.state)
            .field("generation", &state.generation)
            .field("counts", &state.counts)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let clock: Arc<dyn Clock> = match config.clock {
            Some(clock) => clock,
            None => Arc::new(MonotonicClock::default()),
        };
        let ready_to_trip: TripPredicate = match config.ready_to_trip {
            Some(predicate) => predicate,
            None => Arc::new(|counts: &Counts| counts.consecutive_failures > DEFAULT_TRIP_THRESHOLD),
        };
        let interval = non_zero_or(config.interval, DEFAULT_INTERVAL);
        let expiry = Some(clock.now() + interval);

        Self {
            name: Arc::from(config.name),
            max_requests: if config.max_requests == 0 {
                DEFAULT_MAX_REQUESTS
            } else {
                config.max_requests
            },
            interval,
            timeout: non_zero_or(config.timeout, DEFAULT_TIMEOUT),
            ready_to_trip,
            on_state_change: config.on_state_change,
            is_successful: config.is_successful,
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    /// Breaker with default settings.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any due window rollover or open → half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        let now = self.clock.now();
        self.current_state(&mut state, now);
        state.state
    }

    /// Counts of the current generation.
    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Force the breaker closed with a fresh generation and zeroed counts.
    pub fn reset(&self) {
        let mut state = self.lock();
        let now = self.clock.now();
        if state.state == CircuitState::Closed {
            self.to_new_generation(&mut state, now);
        } else {
            self.set_state(&mut state, CircuitState::Closed, now);
        }
    }

    /// Run `op` if the breaker admits it.
    ///
    /// # Errors
    /// - `CircuitOpen` / `TooManyRequests` when rejected; `op` is not invoked.
    /// - Whatever `op` returns otherwise.
    ///
    /// # Panics
    /// A panic inside `op` is recorded as a failure and then resumed.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let generation = self.before_request().map_err(|r| self.rejection(r))?;
        let outcome = AssertUnwindSafe(async move { op().await }).catch_unwind().await;
        self.complete(generation, outcome)
    }

    /// Like [`execute`](Self::execute) but races `op` against the caller's context.
    ///
    /// When the context finishes first the call counts as a failure, `op` is dropped at its
    /// current await point, and `Cancelled`/`DeadlineExceeded` is returned. `op` receives a clone
    /// of the context.
    pub async fn execute_with_context<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let generation = self.before_request().map_err(|r| self.rejection(r))?;
        let call_ctx = ctx.clone();
        let call = AssertUnwindSafe(async move { op(call_ctx).await }).catch_unwind();

        tokio::select! {
            biased;
            done = ctx.done() => {
                self.after_request(generation, false);
                Err(done.into())
            }
            outcome = call => self.complete(generation, outcome),
        }
    }

    /// Like [`execute`](Self::execute) but fails with `CircuitTimeout` (counted as a failure)
    /// when `op` takes longer than `timeout`.
    pub async fn execute_with_timeout<T, E, F, Fut>(
        &self,
        timeout: Duration,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let generation = self.before_request().map_err(|r| self.rejection(r))?;
        let call = AssertUnwindSafe(async move { op().await }).catch_unwind();

        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => self.complete(generation, outcome),
            Err(_) => {
                self.after_request(generation, false);
                Err(ResilienceError::CircuitTimeout { name: self.name.clone(), timeout })
            }
        }
    }

    /// Run `op`; when the breaker rejects it, run `fallback` with the rejection instead.
    /// Failures of `op` itself are returned unchanged.
    pub async fn execute_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        op: F,
        fallback: G,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        G: FnOnce(ResilienceError<E>) -> GFut,
        GFut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match self.execute(op).await {
            Err(err) if err.is_breaker_rejection() => fallback(err).await,
            other => other,
        }
    }

    /// Record an outcome without running anything. Rejected records are dropped.
    pub(crate) fn record(&self, success: bool) {
        if let Ok(generation) = self.before_request() {
            self.after_request(generation, success);
        }
    }

    fn complete<T, E>(
        &self,
        generation: u64,
        outcome: Result<Result<T, ResilienceError<E>>, Box<dyn Any + Send>>,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::error::Error + 'static,
    {
        match outcome {
            Ok(result) => {
                self.after_request(generation, self.is_success(&result));
                result
            }
            Err(panic) => {
                self.after_request(generation, false);
                resume_unwind(panic)
            }
        }
    }

    fn is_success<T, E>(&self, result: &Result<T, ResilienceError<E>>) -> bool
    where
        E: std::error::Error + 'static,
    {
        match result {
            Ok(_) => true,
            Err(err) => match (err.as_inner(), &self.is_successful) {
                (Some(inner), Some(predicate)) => {
                    let inner: &(dyn std::error::Error + 'static) = inner;
                    predicate(inner)
                }
                _ => false,
            },
        }
    }

    fn rejection<E>(&self, rejection: Rejection) -> ResilienceError<E> {
        match rejection {
            Rejection::Open => ResilienceError::CircuitOpen { name: self.name.clone() },
            Rejection::TooManyRequests => ResilienceError::TooManyRequests { name: self.name.clone() },
        }
    }

    fn before_request(&self) -> Result<u64, Rejection> {
        let mut state = self.lock();
        let now = self.clock.now();
        self.current_state(&mut state, now);

        match state.state {
            CircuitState::Open => Err(Rejection::Open),
            CircuitState::HalfOpen if state.counts.requests >= self.max_requests => {
                Err(Rejection::TooManyRequests)
            }
            CircuitState::HalfOpen | CircuitState::Closed => {
                state.counts.on_request();
                Ok(state.generation)
            }
        }
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut state = self.lock();
        let now = self.clock.now();
        self.current_state(&mut state, now);

        if state.generation != generation {
            return;
        }

        match (state.state, success) {
            (CircuitState::Closed, true) => state.counts.on_success(),
            (CircuitState::Closed, false) => {
                state.counts.on_failure();
                if (self.ready_to_trip)(&state.counts) {
                    self.set_state(&mut state, CircuitState::Open, now);
                }
            }
            (CircuitState::HalfOpen, true) => {
                state.counts.on_success();
                if state.counts.consecutive_successes >= self.max_requests {
                    self.set_state(&mut state, CircuitState::Closed, now);
                }
            }
            (CircuitState::HalfOpen, false) => {
                self.set_state(&mut state, CircuitState::Open, now);
            }
            (CircuitState::Open, _) => {}
        }
    }

    fn current_state(&self, state: &mut BreakerState, now: Duration) {
        let expired = state.expiry.is_some_and(|expiry| now >= expiry);
        match state.state {
            CircuitState::Closed if expired => self.to_new_generation(state, now),
            CircuitState::Open if expired => self.set_state(state, CircuitState::HalfOpen, now),
            _ => {}
        }
    }

    fn set_state(&self, state: &mut BreakerState, to: CircuitState, now: Duration) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;

        match (from, to) {
            (CircuitState::Closed, CircuitState::Open) => error!(
                breaker = %self.name,
                failures = state.counts.consecutive_failures,
                "Circuit breaker → open"
            ),
            (CircuitState::HalfOpen, CircuitState::Open) => {
                warn!(breaker = %self.name, "Circuit breaker: probe failed → open")
            }
            (_, CircuitState::HalfOpen) => info!(breaker = %self.name, "Circuit breaker → half-open"),
            (_, CircuitState::Closed) => info!(breaker = %self.name, from = %from, "Circuit breaker → closed"),
            _ => {}
        }

        self.to_new_generation(state, now);

        if let Some(hook) = &self.on_state_change {
            hook(&self.name, from, to);
        }
    }

    fn to_new_generation(&self, state: &mut BreakerState, now: Duration) {
        state.generation = state.generation.wrapping_add(1);
        state.counts = Counts::default();
        state.expiry = match state.state {
            CircuitState::Closed => Some(now + self.interval),
            CircuitState::Open => Some(now + self.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn non_zero_or(value: Duration, default: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        value
    }
}

/// Two breakers in series: the primary reacts to transient failures, the secondary records
/// every call made while the primary is open and, once it trips, rejects everything.
#[derive(Debug)]
pub struct TwoPhaseCircuitBreaker {
    name: Arc<str>,
    primary: CircuitBreaker,
    secondary: CircuitBreaker,
}

impl TwoPhaseCircuitBreaker {
    /// Breakers are named `{name}-primary` and `{name}-secondary`.
    pub fn new(
        name: impl Into<String>,
        primary: CircuitBreakerConfig,
        secondary: CircuitBreakerConfig,
    ) -> Self {
        let name: String = name.into();
        Self {
            primary: CircuitBreaker::new(primary.with_name(format!("{name}-primary"))),
            secondary: CircuitBreaker::new(secondary.with_name(format!("{name}-secondary"))),
            name: Arc::from(name),
        }
    }

    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        if self.secondary.state() == CircuitState::Open {
            return Err(ResilienceError::CircuitOpen { name: self.name.clone() });
        }

        let result = self.primary.execute(op).await;

        if self.primary.state() == CircuitState::Open {
            self.secondary.record(false);
        }

        result
    }

    /// Open while the secondary is open, otherwise the primary's state.
    pub fn state(&self) -> CircuitState {
        if self.secondary.state() == CircuitState::Open {
            return CircuitState::Open;
        }
        self.primary.state()
    }

    pub fn primary(&self) -> &CircuitBreaker {
        &self.primary
    }

    pub fn secondary(&self) -> &CircuitBreaker {
        &self.secondary
    }
}
