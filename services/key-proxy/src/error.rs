//! Service-specific error types

use std::time::Duration;

use axum::http::StatusCode;
use key_pool::ExecuteError;
use thiserror::Error;

/// Ways a relayed request can end without an upstream response.
///
/// Each variant maps to one HTTP status and one `error.type` value in the
/// JSON error body. Upstream responses other than 429 are never errors here;
/// they are relayed verbatim.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no API keys configured")]
    NoAvailableKeys,

    /// The deadline passed while waiting for a ready key or backing off
    /// after a rate limit.
    #[error("request deadline of {deadline:?} exceeded before a key could be used")]
    DeadlineExceeded { deadline: Duration },

    #[error("upstream rate limited every attempt ({attempts} attempts)")]
    RateLimited { attempts: u32 },

    #[error("upstream timeout after {timeout_secs}s")]
    UpstreamTimeout { timeout_secs: u64 },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("invalid request body: {0}")]
    InvalidRequest(String),

    #[error("service is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NoAvailableKeys | Error::DeadlineExceeded { .. } | Error::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Value of `error.type` in the JSON body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::NoAvailableKeys | Error::DeadlineExceeded { .. } => "no_available_keys",
            Error::RateLimited { .. } => "rate_limited",
            Error::UpstreamTimeout { .. } | Error::Upstream(_) => "upstream_error",
            Error::InvalidRequest(_) => "invalid_request",
            Error::ShuttingDown => "shutting_down",
        }
    }

    /// Label for `proxy_upstream_errors_total`, `None` when the upstream was
    /// never at fault.
    pub fn upstream_label(&self) -> Option<&'static str> {
        match self {
            Error::UpstreamTimeout { .. } => Some("timeout"),
            Error::Upstream(_) => Some("connection"),
            Error::RateLimited { .. } => Some("rate_limited"),
            _ => None,
        }
    }

    /// Collapse an orchestrator result. `deadline` is the request deadline
    /// that was passed as the cancel future.
    pub fn from_execute(err: ExecuteError<Error>, deadline: Duration) -> Self {
        match err {
            ExecuteError::NoAvailableKeys => Error::NoAvailableKeys,
            ExecuteError::WorkFailed(e) => e,
            ExecuteError::Exhausted { attempts } => Error::RateLimited { attempts },
            ExecuteError::ShuttingDown => Error::ShuttingDown,
            ExecuteError::Cancelled => Error::DeadlineExceeded { deadline },
        }
    }
}
