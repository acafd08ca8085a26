//! Pool of interchangeable rate-limited API keys
//!
//! Many concurrent callers share a set of keys. Each call is routed through a
//! key that is currently ready; a key rejected for exceeding its rate limit is
//! put on a cooldown and returns automatically once the cooldown decays.
//!
//! Key lifecycle:
//! 1. Pool created with its key set → every key ready (cooldown 0)
//! 2. `acquire` picks a ready key uniformly at random, waiting if none is ready
//! 3. Work reports a rate limit → key penalized for the cooldown duration
//! 4. Background sweep lowers every cooldown by one tick per interval
//! 5. Cooldown reaches 0 → key back in rotation
//! 6. `remove` takes a key out for good
//!
//! `Orchestrator` wraps a unit of work with acquisition, penalties and
//! exponential backoff between attempts.

pub mod cell;
pub mod cooldown;
mod decay;
pub mod error;
pub mod lock;
pub mod outcome;
pub mod pool;
pub mod retry;

pub use cell::PoolCell;
pub use common::ApiKey;
pub use cooldown::Cooldown;
pub use error::{Error, Result};
pub use outcome::{Outcome, OutcomeKind, classify_status, parse_retry_after};
pub use pool::{KeyPool, PoolConfig};
pub use retry::{ExecuteError, Orchestrator, RetryPolicy};
