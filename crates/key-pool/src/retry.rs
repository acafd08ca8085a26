//! Retry orchestration around pooled keys
//!
//! `step` is a pure state machine: it takes the current attempt state and an
//! event and returns the next state plus the action the caller should carry
//! out. `Orchestrator::execute` runs the I/O implied by each action:
//! acquiring keys, running the work, penalizing rate-limited keys and sleeping
//! through the backoff.
//!
//! ```text
//! Idle -> Acquiring -> Executing -> Succeeded
//!             ^            |-----> Failed
//!             |            '-----> RateLimited -> Backoff --+
//!             '---------------------------------------------'
//!                          (Exhausted once max_attempts is reached)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::ApiKey;
use rand::RngExt;
use tracing::{debug, error, info, warn};

use crate::error::Error as PoolError;
use crate::outcome::Outcome;
use crate::pool::KeyPool;

/// Backoff and penalty settings for one logical call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first rate-limited attempt. Doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Cooldown for a rate-limited key when the work gave no `retry_after`.
    pub penalty: Duration,
    /// Full jitter: each delay is drawn uniformly from `[0, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
            max_attempts: 5,
            penalty: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given (1-based) failed attempt, before jitter.
    ///
    /// `min(base * 2^(attempt-1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }
}

/// Where a call stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Acquiring { attempt: u32 },
    Executing { attempt: u32, key: ApiKey },
    Backoff { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
    Exhausted { attempts: u32 },
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded { .. }
                | AttemptState::Failed { .. }
                | AttemptState::Exhausted { .. }
        )
    }
}

/// What just happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    Start,
    KeyAcquired(ApiKey),
    /// Acquisition failed: empty pool, shutdown or cancellation.
    NoKey,
    Succeeded,
    RateLimited,
    WorkFailed,
    BackoffElapsed,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptAction {
    AcquireKey,
    Execute(ApiKey),
    /// Penalize `key`, then sleep for `delay` (zero when no retry follows).
    Penalize { key: ApiKey, delay: Duration },
    Stop,
}

/// Handle one transition. Pure function: no I/O, no randomness.
pub fn step(
    policy: &RetryPolicy,
    state: AttemptState,
    event: AttemptEvent,
) -> (AttemptState, AttemptAction) {
    match (state, event) {
        (AttemptState::Idle, AttemptEvent::Start) => (
            AttemptState::Acquiring { attempt: 1 },
            AttemptAction::AcquireKey,
        ),

        (AttemptState::Acquiring { attempt }, AttemptEvent::KeyAcquired(key)) => (
            AttemptState::Executing {
                attempt,
                key: key.clone(),
            },
            AttemptAction::Execute(key),
        ),

        (AttemptState::Acquiring { attempt }, AttemptEvent::NoKey) => (
            AttemptState::Failed { attempts: attempt },
            AttemptAction::Stop,
        ),

        (AttemptState::Executing { attempt, .. }, AttemptEvent::Succeeded) => (
            AttemptState::Succeeded { attempts: attempt },
            AttemptAction::Stop,
        ),

        (AttemptState::Executing { attempt, .. }, AttemptEvent::WorkFailed) => (
            AttemptState::Failed { attempts: attempt },
            AttemptAction::Stop,
        ),

        (AttemptState::Executing { attempt, key }, AttemptEvent::RateLimited)
            if attempt < policy.max_attempts =>
        {
            let delay = policy.delay_for(attempt);
            (
                AttemptState::Backoff { attempt, delay },
                AttemptAction::Penalize { key, delay },
            )
        }

        // Last attempt: the key is still penalized, but nothing follows
        (AttemptState::Executing { attempt, key }, AttemptEvent::RateLimited) => (
            AttemptState::Exhausted { attempts: attempt },
            AttemptAction::Penalize {
                key,
                delay: Duration::ZERO,
            },
        ),

        (AttemptState::Backoff { attempt, .. }, AttemptEvent::BackoffElapsed) => (
            AttemptState::Acquiring {
                attempt: attempt + 1,
            },
            AttemptAction::AcquireKey,
        ),

        // Invalid/unhandled transition: stay put
        (state, _event) => (state, AttemptAction::Stop),
    }
}

/// Why a call produced no result.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E> {
    #[error("no available keys")]
    NoAvailableKeys,

    #[error("work failed: {0}")]
    WorkFailed(E),

    #[error("rate limited on every attempt ({attempts} attempts)")]
    Exhausted { attempts: u32 },

    #[error("key pool is shutting down")]
    ShuttingDown,

    #[error("cancelled by caller")]
    Cancelled,
}

impl<E> ExecuteError<E> {
    fn from_pool(err: PoolError) -> Self {
        match err {
            PoolError::NoAvailableKeys => ExecuteError::NoAvailableKeys,
            PoolError::ShuttingDown => ExecuteError::ShuttingDown,
            PoolError::Cancelled => ExecuteError::Cancelled,
            PoolError::InvalidCooldown(_) => ExecuteError::NoAvailableKeys,
        }
    }
}

/// Runs units of work through the pool with rate-limit aware retries.
#[derive(Clone)]
pub struct Orchestrator {
    pool: Arc<KeyPool>,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(pool: Arc<KeyPool>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` with a pooled key until it succeeds, fails, or the attempt
    /// budget runs out.
    ///
    /// A rate-limited key is penalized (with the work's `retry_after` hint, or
    /// the policy's penalty) and the call retried after an exponential
    /// backoff, usually with a different key. Other failures end the call
    /// right away. Every terminal outcome other than success comes back as an
    /// `ExecuteError`; nothing panics.
    pub async fn execute<T, E, F, Fut>(&self, work: F) -> Result<T, ExecuteError<E>>
    where
        F: FnMut(ApiKey) -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_with_cancel(work, std::future::pending::<()>())
            .await
    }

    /// Like [`execute`](Self::execute), but stops with `Cancelled` as soon as
    /// `cancel` completes, whether the call is waiting for a key or backing
    /// off. Work already running is allowed to finish its current attempt.
    pub async fn execute_with_cancel<T, E, F, Fut, C>(
        &self,
        mut work: F,
        cancel: C,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut(ApiKey) -> Fut,
        Fut: Future<Output = Outcome<T, E>>,
        E: std::fmt::Display,
        C: Future<Output = ()>,
    {
        let mut cancel = std::pin::pin!(cancel);
        let mut shutdown = std::pin::pin!(self.pool.shut_down());
        let (mut state, mut action) = step(&self.policy, AttemptState::Idle, AttemptEvent::Start);
        let mut last_error: Option<ExecuteError<E>> = None;
        let mut value: Option<T> = None;
        let mut retry_after: Option<Duration> = None;

        loop {
            let event = match action {
                AttemptAction::AcquireKey => match self.pool.acquire_with_cancel(&mut cancel).await {
                    Ok(key) => AttemptEvent::KeyAcquired(key),
                    Err(e) => {
                        warn!(error = %e, "could not acquire a key");
                        last_error = Some(ExecuteError::from_pool(e));
                        AttemptEvent::NoKey
                    }
                },

                AttemptAction::Execute(key) => match work(key.clone()).await {
                    Outcome::Success(v) => {
                        value = Some(v);
                        AttemptEvent::Succeeded
                    }
                    Outcome::RateLimited { retry_after: hint } => {
                        retry_after = hint;
                        AttemptEvent::RateLimited
                    }
                    Outcome::Failed(e) => {
                        error!(key = %key, error = %e, "work failed, not retrying");
                        last_error = Some(ExecuteError::WorkFailed(e));
                        AttemptEvent::WorkFailed
                    }
                },

                AttemptAction::Penalize { key, delay } => {
                    let cooldown = retry_after.take().unwrap_or(self.policy.penalty);
                    self.pool.penalize_for(&key, cooldown).await;
                    info!(
                        key = %key,
                        cooldown_secs = cooldown.as_secs(),
                        "rate limit reached, key will be retried after its cooldown"
                    );

                    if state.is_terminal() {
                        break;
                    }

                    let delay = self.policy.jittered(delay);
                    debug!(delay_ms = delay.as_millis() as u64, "backing off before retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => AttemptEvent::BackoffElapsed,
                        _ = &mut shutdown => {
                            last_error = Some(ExecuteError::ShuttingDown);
                            break;
                        }
                        _ = &mut cancel => {
                            last_error = Some(ExecuteError::Cancelled);
                            break;
                        }
                    }
                }

                AttemptAction::Stop => break,
            };

            (state, action) = step(&self.policy, state, event);
        }

        match state {
            AttemptState::Succeeded { .. } => match value {
                Some(v) => Ok(v),
                None => Err(ExecuteError::ShuttingDown),
            },
            AttemptState::Exhausted { attempts } => {
                warn!(attempts, "giving up, every attempt was rate limited");
                Err(ExecuteError::Exhausted { attempts })
            }
            _ => Err(last_error.unwrap_or(ExecuteError::ShuttingDown)),
        }
    }
}
