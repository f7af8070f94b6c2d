//! Build queue API contract
//!
//! The worker talks to the server only through [`BuildQueueApi`]. The HTTP
//! implementation lives in [`crate::http`]; tests use the in-memory
//! `FakeBuildQueue` behind the `test-support` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ApiResult;
use crate::job::{BuildStatus, Job};
use crate::queue::QueueName;

/// Host facts sent when registering a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub platform: String,
    pub hostname: String,
    pub dist: String,
}

/// Addresses the log stream of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub queue: QueueName,
    pub worker_id: String,
    pub job_id: String,
}

/// Tags attached to a structured log call
pub type LogMetadata = BTreeMap<String, String>;

/// Server reply to a log call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogResponse {
    /// The server asks the worker to stop the running build
    #[serde(default)]
    pub terminate_build: bool,
}

/// Remote operations the worker needs from the build queue server.
///
/// `pop_build_job` fails with [`crate::ApiError::NotFound`] when the worker
/// record no longer exists, and `log_build_output_structured` fails with it
/// when the server does not support structured logs.
#[async_trait]
pub trait BuildQueueApi: Send + Sync {
    /// Register a worker and return the server-assigned worker id
    async fn register_worker(
        &self,
        queue: &QueueName,
        registration: &WorkerRegistration,
    ) -> ApiResult<String>;

    /// Remove a worker; returns `true` if it existed
    async fn remove_worker(&self, queue: &QueueName, worker_id: &str) -> ApiResult<bool>;

    /// Claim the next job, or `None` when the queue is empty
    async fn pop_build_job(&self, queue: &QueueName, worker_id: &str) -> ApiResult<Option<Job>>;

    /// Return a claimed job to the queue without running it
    async fn push_build_job(&self, queue: &QueueName, worker_id: &str, job_id: &str)
        -> ApiResult<()>;

    /// Report the terminal status of a job
    async fn finish_build(
        &self,
        queue: &QueueName,
        worker_id: &str,
        job_id: &str,
        status: BuildStatus,
        failed: bool,
    ) -> ApiResult<()>;

    /// Append plain text to a job's build log
    async fn log_build_output(&self, target: &LogTarget, text: &str) -> ApiResult<LogResponse>;

    /// Append tagged text to a job's build log
    async fn log_build_output_structured(
        &self,
        target: &LogTarget,
        text: &str,
        metadata: &LogMetadata,
    ) -> ApiResult<LogResponse>;

    /// Stream the job's source tarball into `dest`.
    ///
    /// Returns `false`, leaving `dest` untouched, when the server has no
    /// source for the job.
    async fn fetch_build_source(
        &self,
        queue: &QueueName,
        worker_id: &str,
        job_id: &str,
        dest: &Path,
    ) -> ApiResult<bool>;
}
