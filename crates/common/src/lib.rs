//! Common types shared by the key pool and the relay service

mod error;
mod key;

pub use error::{Error, Result};
pub use key::ApiKey;
