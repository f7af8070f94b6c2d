//! Error types shared across buildq crates

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors. These are fatal at startup and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid queue name '{0}': expected 'username/queue'")]
    InvalidQueueName(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Errors returned by the remote build queue
#[derive(Debug, Error)]
pub enum ApiError {
    /// The addressed resource (worker, job, or endpoint) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    /// A download could not be written to disk
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
