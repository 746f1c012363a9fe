#![allow(dead_code)]

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError(pub &'static str);

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream error: {}", self.0)
    }
}

impl std::error::Error for UpstreamError {}

pub fn fail<T>() -> Result<T, steadfast::ResilienceError<UpstreamError>> {
    Err(steadfast::ResilienceError::Inner(UpstreamError("down")))
}
