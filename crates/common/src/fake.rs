//! In-memory build queue for tests
//!
//! Records every call so tests can assert on registrations, finished builds,
//! pushed-back jobs and the delivered build log.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::api::{BuildQueueApi, LogMetadata, LogResponse, LogTarget, WorkerRegistration};
use crate::error::{ApiError, ApiResult};
use crate::job::{BuildStatus, Job};
use crate::queue::QueueName;

/// A `finish_build` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedBuild {
    pub job_id: String,
    pub status: BuildStatus,
    pub failed: bool,
}

/// A delivered log call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogCall {
    pub job_id: String,
    pub text: String,
    /// `None` for plain calls
    pub metadata: Option<LogMetadata>,
}

#[derive(Default)]
struct State {
    next_worker: u32,
    workers: HashMap<String, QueueName>,
    jobs: VecDeque<Job>,
    sources: HashMap<String, Vec<u8>>,
    finished: Vec<FinishedBuild>,
    pushed: Vec<String>,
    logs: Vec<LogCall>,
    structured_unsupported: bool,
    structured_attempts: usize,
    terminate_build: bool,
    failing_log_calls: usize,
}

/// In-memory [`BuildQueueApi`]
#[derive(Default)]
pub struct FakeBuildQueue {
    state: Mutex<State>,
}

impl FakeBuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a worker id directly, bypassing `register_worker`
    pub fn add_worker(&self, queue: &QueueName, worker_id: &str) {
        self.state()
            .workers
            .insert(worker_id.to_string(), queue.clone());
    }

    pub fn has_worker(&self, worker_id: &str) -> bool {
        self.state().workers.contains_key(worker_id)
    }

    pub fn push_job(&self, job: Job) {
        self.state().jobs.push_back(job);
    }

    pub fn set_source(&self, job_id: &str, bytes: Vec<u8>) {
        self.state().sources.insert(job_id.to_string(), bytes);
    }

    /// Make the structured log endpoint answer `NotFound`
    pub fn set_structured_supported(&self, supported: bool) {
        self.state().structured_unsupported = !supported;
    }

    /// Ask every following log call to report `terminate_build`
    pub fn set_terminate_build(&self, terminate: bool) {
        self.state().terminate_build = terminate;
    }

    /// Fail the next `count` log calls with a transport error
    pub fn fail_next_log_calls(&self, count: usize) {
        self.state().failing_log_calls = count;
    }

    pub fn finished(&self) -> Vec<FinishedBuild> {
        self.state().finished.clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state().pushed.clone()
    }

    pub fn pending_jobs(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn log_calls(&self) -> Vec<LogCall> {
        self.state().logs.clone()
    }

    /// Number of attempted structured log calls, including rejected ones
    pub fn structured_attempts(&self) -> usize {
        self.state().structured_attempts
    }

    /// Concatenation of every delivered log text, in delivery order
    pub fn log_text(&self) -> String {
        self.state().logs.iter().map(|c| c.text.as_str()).collect()
    }

    fn record_log(
        &self,
        target: &LogTarget,
        text: &str,
        metadata: Option<&LogMetadata>,
    ) -> ApiResult<LogResponse> {
        let mut state = self.state();
        if state.failing_log_calls > 0 {
            state.failing_log_calls -= 1;
            return Err(ApiError::Transport("connection reset".to_string()));
        }
        state.logs.push(LogCall {
            job_id: target.job_id.clone(),
            text: text.to_string(),
            metadata: metadata.cloned(),
        });
        Ok(LogResponse {
            terminate_build: state.terminate_build,
        })
    }
}

#[async_trait]
impl BuildQueueApi for FakeBuildQueue {
    async fn register_worker(
        &self,
        queue: &QueueName,
        _registration: &WorkerRegistration,
    ) -> ApiResult<String> {
        let mut state = self.state();
        state.next_worker += 1;
        let worker_id = format!("worker-{}", state.next_worker);
        state.workers.insert(worker_id.clone(), queue.clone());
        Ok(worker_id)
    }

    async fn remove_worker(&self, _queue: &QueueName, worker_id: &str) -> ApiResult<bool> {
        Ok(self.state().workers.remove(worker_id).is_some())
    }

    async fn pop_build_job(&self, _queue: &QueueName, worker_id: &str) -> ApiResult<Option<Job>> {
        let mut state = self.state();
        if !state.workers.contains_key(worker_id) {
            return Err(ApiError::NotFound(format!("worker {}", worker_id)));
        }
        Ok(state.jobs.pop_front())
    }

    async fn push_build_job(
        &self,
        _queue: &QueueName,
        _worker_id: &str,
        job_id: &str,
    ) -> ApiResult<()> {
        self.state().pushed.push(job_id.to_string());
        Ok(())
    }

    async fn finish_build(
        &self,
        _queue: &QueueName,
        _worker_id: &str,
        job_id: &str,
        status: BuildStatus,
        failed: bool,
    ) -> ApiResult<()> {
        self.state().finished.push(FinishedBuild {
            job_id: job_id.to_string(),
            status,
            failed,
        });
        Ok(())
    }

    async fn log_build_output(&self, target: &LogTarget, text: &str) -> ApiResult<LogResponse> {
        self.record_log(target, text, None)
    }

    async fn log_build_output_structured(
        &self,
        target: &LogTarget,
        text: &str,
        metadata: &LogMetadata,
    ) -> ApiResult<LogResponse> {
        {
            let mut state = self.state();
            state.structured_attempts += 1;
            if state.structured_unsupported {
                return Err(ApiError::NotFound("tagged-log".to_string()));
            }
        }
        self.record_log(target, text, Some(metadata))
    }

    async fn fetch_build_source(
        &self,
        _queue: &QueueName,
        _worker_id: &str,
        job_id: &str,
        dest: &Path,
    ) -> ApiResult<bool> {
        let Some(bytes) = self.state().sources.get(job_id).cloned() else {
            return Ok(false);
        };
        std::fs::write(dest, bytes).map_err(|source| ApiError::Write {
            path: dest.to_path_buf(),
            source,
        })?;
        Ok(true)
    }
}
