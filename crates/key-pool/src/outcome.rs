//! Outcome of one unit of work performed with a pooled key
//!
//! The work reports one of three distinguishable signals. Only `RateLimited`
//! feeds back into the pool (the key is penalized and the call retried with
//! another key); `Failed` is terminal for the call.

use std::time::Duration;

/// Result of running a unit of work with a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// The work completed; its value is returned to the caller.
    Success(T),
    /// The key was rejected for exceeding a rate limit.
    ///
    /// `retry_after` carries an upstream hint for how long the key should
    /// rest. When absent the orchestrator applies its configured penalty.
    RateLimited { retry_after: Option<Duration> },
    /// Any other failure. Not retried.
    Failed(E),
}

/// Discriminant of an [`Outcome`], used by classifiers and the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    RateLimited,
    Failed,
}

impl<T, E> Outcome<T, E> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success(_) => OutcomeKind::Success,
            Outcome::RateLimited { .. } => OutcomeKind::RateLimited,
            Outcome::Failed(_) => OutcomeKind::Failed,
        }
    }

    /// Shorthand for a rate limit without an upstream hint.
    pub fn rate_limited() -> Self {
        Outcome::RateLimited { retry_after: None }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// Classify an upstream HTTP status.
///
/// 429 means the key hit its rate limit. Every other status is relayed to the
/// caller as-is: checking whether a key is valid (401/403) is the upstream's
/// business, and 5xx responses say nothing about the key.
pub fn classify_status(status: u16) -> OutcomeKind {
    match status {
        429 => OutcomeKind::RateLimited,
        _ => OutcomeKind::Success,
    }
}

/// Parse a `Retry-After` header given in delay-seconds form.
///
/// HTTP-date values, negative numbers and fractions are ignored; the caller
/// then falls back to its default penalty.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
