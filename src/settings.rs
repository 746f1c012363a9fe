//! Serializable description of a decorator, for loading from configuration files.
//!
//! Durations are whole milliseconds. Missing fields take the runtime defaults, and a missing
//! layer stays out of the decorator.
//!
//! ```
//! # #[derive(Debug)] struct MyErr;
//! # impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! # impl std::error::Error for MyErr {}
//! let settings: steadfast::ResilienceSettings = serde_json::from_str(
//!     r#"{ "retry": { "max_attempts": 5 }, "circuit_breaker": { "name": "crm", "trip_after": 3 } }"#,
//! ).unwrap();
//! let decorator = settings.build::<MyErr>().unwrap();
//! assert_eq!(decorator.retryer().map(|r| r.max_attempts()), Some(5));
//! ```

use crate::bulkhead::BulkheadConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::decorator::{ResilienceConfig, ResilienceDecorator};
use crate::error::ConfigError;
use crate::rate_limit::RateLimiterConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceSettings {
    pub retry: Option<RetrySettings>,
    pub rate_limiter: Option<RateLimiterSettings>,
    pub bulkhead: Option<BulkheadSettings>,
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

impl ResilienceSettings {
    pub fn into_config(self) -> ResilienceConfig {
        ResilienceConfig {
            retry: self.retry.map(Into::into),
            rate_limiter: self.rate_limiter.map(Into::into),
            bulkhead: self.bulkhead.map(Into::into),
            circuit_breaker: self.circuit_breaker.map(Into::into),
        }
    }

    pub fn build<E>(self) -> Result<ResilienceDecorator<E>, ConfigError>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ResilienceDecorator::new(self.into_config())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: millis(config.initial_delay),
            max_delay_ms: millis(config.max_delay),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl From<RetrySettings> for RetryConfig {
    fn from(s: RetrySettings) -> Self {
        RetryConfig {
            max_attempts: s.max_attempts,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            multiplier: s.multiplier,
            jitter: s.jitter,
        }
    }
}

/// `burst: 0` means "same as rate".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterSettings {
    pub name: String,
    pub rate: u32,
    pub burst: u32,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self { name: String::new(), rate: 10, burst: 0 }
    }
}

impl From<RateLimiterSettings> for RateLimiterConfig {
    fn from(s: RateLimiterSettings) -> Self {
        RateLimiterConfig::new(s.name).rate(s.rate).burst(s.burst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadSettings {
    pub name: String,
    pub max_concurrent: usize,
    pub max_wait_ms: u64,
}

impl Default for BulkheadSettings {
    fn default() -> Self {
        Self { name: String::new(), max_concurrent: 10, max_wait_ms: 0 }
    }
}

impl From<BulkheadSettings> for BulkheadConfig {
    fn from(s: BulkheadSettings) -> Self {
        BulkheadConfig::new(s.name)
            .max_concurrent(s.max_concurrent)
            .max_wait(Duration::from_millis(s.max_wait_ms))
    }
}

/// Without `trip_after` the breaker trips once more than 5 consecutive failures are seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    pub name: String,
    pub max_requests: u32,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_after: Option<u32>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self {
            name: String::new(),
            max_requests: config.max_requests(),
            interval_ms: millis(config.interval()),
            timeout_ms: millis(config.timeout()),
            trip_after: None,
        }
    }
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: CircuitBreakerSettings) -> Self {
        let config = CircuitBreakerConfig::new(s.name)
            .with_max_requests(s.max_requests)
            .with_interval(Duration::from_millis(s.interval_ms))
            .with_timeout(Duration::from_millis(s.timeout_ms));
        match s.trip_after {
            Some(failures) => config.trip_after(failures),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_builds_no_layers() {
        let settings: ResilienceSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ResilienceSettings::default());
        let config = settings.into_config();
        assert!(config.retry.is_none());
        assert!(config.circuit_breaker.is_none());
    }

    #[test]
    fn partial_layers_take_defaults() {
        let settings: ResilienceSettings = serde_json::from_str(
            r#"{
                "retry": { "max_attempts": 4, "jitter": 0.0 },
                "bulkhead": { "name": "db", "max_wait_ms": 250 },
                "rate_limiter": { "rate": 50 }
            }"#,
        )
        .unwrap();

        let retry = RetryConfig::from(settings.retry.clone().expect("retry present"));
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.initial_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        assert_eq!(retry.jitter, 0.0);

        let bulkhead = BulkheadConfig::from(settings.bulkhead.clone().expect("bulkhead present"));
        assert_eq!(bulkhead.max_concurrent, 10);
        assert_eq!(bulkhead.max_wait, Duration::from_millis(250));

        let limiter = RateLimiterConfig::from(settings.rate_limiter.clone().expect("limiter present"));
        assert_eq!(limiter.rate, 50);
        assert_eq!(limiter.burst, 0);
    }

    #[test]
    fn breaker_settings_round_trip_through_json() {
        let settings = CircuitBreakerSettings { name: "crm".into(), trip_after: Some(2), ..Default::default() };
        let json = serde_json::to_string(&settings).unwrap();
        let back: CircuitBreakerSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);

        let config = CircuitBreakerConfig::from(back);
        assert_eq!(config.name(), "crm");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.interval(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed = serde_json::from_str::<ResilienceSettings>(r#"{ "retries": {} }"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn invalid_retry_values_fail_at_build() {
        let settings = ResilienceSettings {
            retry: Some(RetrySettings { jitter: 1.5, ..RetrySettings::default() }),
            ..ResilienceSettings::default()
        };

        #[derive(Debug)]
        struct E;
        impl std::fmt::Display for E {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "e")
            }
        }
        impl std::error::Error for E {}

        assert!(settings.build::<E>().is_err());
    }
}
