//! Per-service circuit breaking with call metrics.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::context::CallContext;
use crate::error::ResilienceError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// Call tallies for one service. Unlike breaker [`Counts`](crate::Counts) these never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls the breaker refused (`CircuitOpen` / `TooManyRequests`).
    pub total_rejected: u64,
    pub state_changes: u64,
    pub last_state_change: Option<SystemTime>,
    pub current_state: CircuitState,
}

type MetricsMap = Arc<Mutex<HashMap<String, CircuitBreakerMetrics>>>;

fn update(metrics: &MetricsMap, service: &str, apply: impl FnOnce(&mut CircuitBreakerMetrics)) {
    let mut map = metrics.lock().unwrap_or_else(PoisonError::into_inner);
    apply(map.entry(service.to_string()).or_default());
}

/// Guards calls to named services, one breaker per service, and records metrics per service.
#[derive(Debug)]
pub struct ServiceCircuitBreaker {
    registry: CircuitBreakerRegistry,
    metrics: MetricsMap,
}

impl Default for ServiceCircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl ServiceCircuitBreaker {
    /// Every service breaker is built from `config`. A state-change hook already on `config`
    /// keeps firing after the metrics are recorded.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let metrics: MetricsMap = Arc::default();
        let recorder = metrics.clone();
        let user_hook = config.on_state_change.clone();

        let config = config.on_state_change(move |name, from, to| {
            update(&recorder, name, |m| {
                m.state_changes += 1;
                m.last_state_change = Some(SystemTime::now());
                m.current_state = to;
            });
            if let Some(hook) = &user_hook {
                hook(name, from, to);
            }
        });

        Self { registry: CircuitBreakerRegistry::new(config), metrics }
    }

    /// Run `op` through the breaker of `service`.
    pub async fn call<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        service: &str,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: std::error::Error + 'static,
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let breaker = self.registry.get(service);
        update(&self.metrics, service, |m| m.total_requests += 1);

        let result = breaker.execute_with_context(ctx, op).await;

        update(&self.metrics, service, |m| match &result {
            Ok(_) => m.total_successes += 1,
            Err(err) if err.is_breaker_rejection() => m.total_rejected += 1,
            Err(_) => m.total_failures += 1,
        });
        result
    }

    pub fn state(&self, service: &str) -> CircuitState {
        self.registry.get(service).state()
    }

    /// `None` until the service has been called or changed state.
    pub fn metrics(&self, service: &str) -> Option<CircuitBreakerMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).get(service).cloned()
    }

    pub fn all_metrics(&self) -> HashMap<String, CircuitBreakerMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reset(&self, service: &str) {
        self.registry.get(service).reset();
    }

    pub fn registry(&self) -> &CircuitBreakerRegistry {
        &self.registry
    }
}
