//! Registry of named circuit breakers.
//!
//! One registry is built at start-up and handed to every call site; the same name always
//! resolves to the same shared breaker.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// Get-or-create cache of breakers keyed by dependency name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Breakers created by [`get`](Self::get) use `config` with the name substituted.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { breakers: RwLock::new(HashMap::new()), config }
    }

    /// The breaker for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).get(name)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone().with_name(name))))
            .clone()
    }

    /// Insert a breaker built elsewhere under its own name, replacing any existing one.
    pub fn register(&self, breaker: Arc<CircuitBreaker>) {
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let name = breaker.name().to_string();
        if breakers.insert(name.clone(), breaker).is_some() {
            warn!(target: "steadfast::circuit_breaker_registry", name = %name, "circuit breaker replaced; last registration wins");
        }
    }

    /// Drop the breaker for `name`. Holders of the `Arc` keep using their instance.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().unwrap_or_else(PoisonError::into_inner).remove(name)
    }

    pub fn list(&self) -> HashMap<String, Arc<CircuitBreaker>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn reset_all(&self) {
        for breaker in self.list().values() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Health view over a registry: healthy iff every breaker is closed.
#[derive(Debug, Clone)]
pub struct CircuitBreakerHealthCheck {
    registry: Arc<CircuitBreakerRegistry>,
}

impl CircuitBreakerHealthCheck {
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self { registry }
    }

    /// Name → `"closed" | "open" | "half-open"`.
    pub fn check(&self) -> HashMap<String, &'static str> {
        self.registry
            .list()
            .into_iter()
            .map(|(name, breaker)| (name, breaker.state().as_str()))
            .collect()
    }

    /// Vacuously true for an empty registry.
    pub fn is_healthy(&self) -> bool {
        self.registry.list().values().all(|breaker| breaker.state() == CircuitState::Closed)
    }
}
