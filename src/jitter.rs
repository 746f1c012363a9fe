//! Jitter applied to retry delays so that callers failing together do not retry together.
//!
//! - `None`: exact delays, for tests or tightly controlled workflows.
//! - `Proportional(f)`: uniform in `[delay * (1 - f), delay * (1 + f)]`, the retryer default
//!   (`f = 0.2`).
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay / 2, delay]`.
//!
//! Decorrelated jitter carries state between attempts and therefore lives with the backoff
//! strategies as [`DecorrelatedJitterBackoff`](crate::backoff::DecorrelatedJitterBackoff).

use crate::backoff::scale;
use crate::error::ConfigError;
use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    #[default]
    None,
    Proportional(f64),
    Full,
    Equal,
}

impl Jitter {
    /// `± factor * delay`; `factor` must lie in `[0, 1]`.
    pub fn proportional(factor: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(ConfigError::OutOfRange { field: "jitter", value: factor });
        }
        if factor == 0.0 {
            return Ok(Jitter::None);
        }
        Ok(Jitter::Proportional(factor))
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let (lower, upper) = match *self {
            Jitter::None => return delay,
            Jitter::Proportional(factor) => {
                let factor = factor.clamp(0.0, 1.0);
                (scale(delay, 1.0 - factor), scale(delay, 1.0 + factor))
            }
            Jitter::Full => (Duration::ZERO, delay),
            Jitter::Equal => (delay / 2, delay),
        };
        let lower = nanos(lower);
        let upper = nanos(upper).max(lower);
        Duration::from_nanos(rng.random_range(lower..=upper))
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
