//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no available keys: the pool is empty")]
    NoAvailableKeys,

    #[error("invalid cooldown: {0} (must be >= 0)")]
    InvalidCooldown(i64),

    #[error("key pool is shutting down")]
    ShuttingDown,

    #[error("key acquisition cancelled")]
    Cancelled,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
