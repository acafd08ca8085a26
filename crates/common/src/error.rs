//! Common error types

use std::path::PathBuf;

use thiserror::Error;

/// Common error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to read keys file {}: {source}", path.display())]
    KeysFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
