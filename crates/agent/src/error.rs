//! Agent error types

use buildq_common::{ApiError, ConfigError};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the worker execution core
#[derive(Debug, Error)]
pub enum AgentError {
    /// Bad or missing configuration; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("build queue API error: {0}")]
    Api(#[from] ApiError),

    /// The server no longer knows this worker; it was removed out-of-band
    #[error("worker {0} no longer exists on the server (was it removed?)")]
    WorkerRemoved(String),

    #[error("worker {worker_id} is already running (pid {pid})")]
    AlreadyRunning { worker_id: String, pid: u32 },

    /// Another process holds the worker's lock but has not recorded its pid yet
    #[error("worker {0} is being started by another process")]
    IdentityLocked(String),

    #[error("worker {0} is marked running but its process is gone; run with --clean first")]
    StaleIdentity(String),

    #[error("worker {0} not found")]
    IdentityNotFound(String),

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("docker error: {0}")]
    Docker(String),

    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("build log delivery failed: {0}")]
    Log(String),

    #[error("failed to access {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AgentError {
    /// Fatal errors stop the worker; everything else is confined to one job
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Config(_)
                | AgentError::InvalidConfig(_)
                | AgentError::WorkerRemoved(_)
                | AgentError::AlreadyRunning { .. }
                | AgentError::IdentityLocked(_)
                | AgentError::StaleIdentity(_)
                | AgentError::IdentityNotFound(_)
        )
    }

    pub(crate) fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Path {
            path: path.into(),
            source,
        }
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
