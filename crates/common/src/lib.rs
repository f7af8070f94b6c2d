//! buildq-common
//!
//! Types and infrastructure shared by the buildq worker and CLI:
//! - Build job data model and outcome classification
//! - Queue names and worker configuration
//! - The build queue API contract and its HTTP client

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod job;
pub mod queue;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use api::{BuildQueueApi, LogMetadata, LogResponse, LogTarget, WorkerRegistration};
pub use config::Config;
pub use error::{ApiError, ApiResult, ConfigError};
pub use http::HttpBuildQueue;
pub use job::{
    BuildOutcome, BuildStatus, Instructions, Job, Phase, PhaseCommand, EXIT_ERROR, EXIT_FAILURE,
    EXIT_SUCCESS,
};
pub use queue::QueueName;
