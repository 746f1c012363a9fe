//! Backoff strategies for retries.
//!
//! Attempt semantics: `attempt` is the zero-based index of the attempt that just failed, so
//! `next_delay(0)` is the wait before the second attempt. Arithmetic saturates at
//! `Duration::MAX` rather than overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use steadfast::backoff::{BackoffStrategy, ExponentialBackoff};
//!
//! let backoff =
//!     ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0).unwrap();
//! assert_eq!(backoff.next_delay(0), Duration::from_secs(1));
//! assert_eq!(backoff.next_delay(1), Duration::from_secs(2));
//! assert_eq!(backoff.next_delay(10), Duration::from_secs(30)); // capped
//! ```

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Computes the wait between attempts.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    /// Delay to wait after the zero-based `attempt` failed.
    fn next_delay(&self, attempt: usize) -> Duration;

    /// Forget any state carried between calls. Called after a successful attempt.
    fn reset(&self) {}
}

/// Multiply a duration by a non-negative float, saturating at `Duration::MAX`.
pub(crate) fn scale(delay: Duration, factor: f64) -> Duration {
    let nanos = delay.as_nanos() as f64 * factor;
    // NaN only arises from a zero delay times an infinite factor.
    if nanos.is_nan() || nanos <= 0.0 {
        return Duration::ZERO;
    }
    if nanos < u64::MAX as f64 {
        return Duration::from_nanos(nanos.round() as u64);
    }
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

fn check_cap(base: Duration, max: Duration) -> Result<(), ConfigError> {
    if max.is_zero() {
        return Err(ConfigError::MustBePositive { field: "max_delay" });
    }
    if max < base {
        return Err(ConfigError::MaxLessThanBase { base, max });
    }
    Ok(())
}

/// `initial * multiplier^attempt`, clamped to `[0, max]`.
///
/// Any finite multiplier `>= 0` is accepted: below 1 the delay shrinks, and a `max` of zero
/// (or below `initial`) pins every delay at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Result<Self, ConfigError> {
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(ConfigError::OutOfRange { field: "multiplier", value: multiplier });
        }
        Ok(Self { initial, max, multiplier })
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for ExponentialBackoff {
    /// 1s doubling up to 30s.
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(30), multiplier: 2.0 }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(i32::MAX as usize) as i32;
        scale(self.initial, self.multiplier.powi(exponent)).min(self.max)
    }
}

/// `initial + attempt * increment`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearBackoff {
    initial: Duration,
    increment: Duration,
    max: Duration,
}

impl LinearBackoff {
    pub fn new(initial: Duration, increment: Duration, max: Duration) -> Result<Self, ConfigError> {
        check_cap(initial, max)?;
        Ok(Self { initial, increment, max })
    }
}

impl BackoffStrategy for LinearBackoff {
    fn next_delay(&self, attempt: usize) -> Duration {
        let steps = attempt.min(u32::MAX as usize) as u32;
        let grown = self
            .increment
            .checked_mul(steps)
            .and_then(|inc| self.initial.checked_add(inc))
            .unwrap_or(Duration::MAX);
        grown.min(self.max)
    }
}

/// The same delay every time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for ConstantBackoff {
    fn next_delay(&self, _attempt: usize) -> Duration {
        self.delay
    }
}

/// AWS-style decorrelated jitter: `min(max, random(base, last * 3))`.
///
/// Stateful: each delay seeds the next one. `next_delay(0)` and `reset()` restart the
/// sequence at `base`.
#[derive(Debug)]
pub struct DecorrelatedJitterBackoff {
    base: Duration,
    max: Duration,
    last: Mutex<Duration>,
}

impl DecorrelatedJitterBackoff {
    pub fn new(base: Duration, max: Duration) -> Result<Self, ConfigError> {
        check_cap(base, max)?;
        Ok(Self { base, max, last: Mutex::new(base) })
    }

    /// Same as [`BackoffStrategy::next_delay`] but with a caller-supplied RNG.
    pub fn next_delay_with_rng<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if attempt == 0 {
            *last = self.base;
            return self.base;
        }

        let lower = saturating_nanos(self.base);
        let upper = saturating_nanos(*last).saturating_mul(3).max(lower);
        let picked = Duration::from_nanos(rng.random_range(lower..=upper));

        *last = picked.min(self.max);
        *last
    }
}

fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl Clone for DecorrelatedJitterBackoff {
    fn clone(&self) -> Self {
        let last = *self.last.lock().unwrap_or_else(PoisonError::into_inner);
        Self { base: self.base, max: self.max, last: Mutex::new(last) }
    }
}

impl BackoffStrategy for DecorrelatedJitterBackoff {
    fn next_delay(&self, attempt: usize) -> Duration {
        self.next_delay_with_rng(attempt, &mut rng())
    }

    fn reset(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = self.base;
    }
}
