//! The job loop
//!
//! A [`Worker`] claims one job at a time from its queue and either pushes it
//! back untouched or builds it and reports the outcome. A single job can
//! never crash the loop: anything that goes wrong while building becomes an
//! `error` outcome. Only losing the worker record on the server, or a
//! shutdown through [`Worker::shutdown_token`], stops it. A shutdown during a
//! build kills the build, reports it as `error`, and then returns.

use buildq_common::config::WorkerConfig;
use buildq_common::{ApiError, BuildOutcome, BuildQueueApi, Job, LogTarget, QueueName};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::identity::{IdentityStore, WorkerIdentity};
use crate::journal::{Journal, JournalEvent};
use crate::log_sink::{BuildLog, LogOptions, LogTransport, OutputSink};
use crate::script::{self, ScriptContext, SourceStaging, SCRIPT_NAME, SOURCE_TARBALL};
use crate::strategy::ExecutionStrategy;
use crate::supervisor::Limits;

/// Job loop settings
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Return every claimed job to the queue instead of building it
    pub push_back: bool,
    /// Stop after the first claimed job
    pub run_once: bool,
    /// Surface the raw API error when the worker record disappears
    pub show_traceback: bool,
    /// Do not stage any source before the build
    pub no_fetch: bool,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Used when the job does not set its own
    pub iotimeout: Duration,
    pub log_flush_interval: Duration,
    /// Echo build output to stdout
    pub echo: bool,
    pub upload_command: Option<String>,
    pub build_dir: PathBuf,
}

impl WorkerOptions {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            push_back: false,
            run_once: false,
            show_traceback: false,
            no_fetch: false,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            iotimeout: Duration::from_secs(config.iotimeout),
            log_flush_interval: config.log_flush_interval(),
            echo: true,
            upload_command: config.upload_command.clone(),
            build_dir: config.build_dir.clone(),
        }
    }
}

/// A registered worker bound to its queue, strategy and journal
pub struct Worker {
    api: Arc<dyn BuildQueueApi>,
    store: IdentityStore,
    identity: WorkerIdentity,
    queue: QueueName,
    strategy: Box<dyn ExecutionStrategy>,
    journal: Journal,
    transport: Arc<LogTransport>,
    options: WorkerOptions,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        api: Arc<dyn BuildQueueApi>,
        store: IdentityStore,
        identity: WorkerIdentity,
        strategy: Box<dyn ExecutionStrategy>,
        journal: Journal,
        options: WorkerOptions,
    ) -> Self {
        let queue = identity.queue_name();
        let transport = Arc::new(LogTransport::new(api.clone()));
        Self {
            api,
            store,
            identity,
            queue,
            strategy,
            journal,
            transport,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Cancel this token to stop the loop, terminating any running build
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sleep for the poll interval, waking early on shutdown
    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.options.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    fn worker_id(&self) -> &str {
        &self.identity.worker_id
    }

    /// Run the job loop until stopped.
    ///
    /// Holds the identity's running guard for the whole loop.
    pub async fn run(&self) -> AgentResult<()> {
        let _guard = self.store.acquire(self.worker_id())?;
        info!(
            worker_id = %self.worker_id(),
            queue = %self.queue,
            strategy = self.strategy.name(),
            "Worker started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                info!(worker_id = %self.worker_id(), "Shutdown requested, stopping worker");
                return Ok(());
            }

            let job = match self.api.pop_build_job(&self.queue, self.worker_id()).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(worker_id = %self.worker_id(), "No job available");
                    self.idle().await;
                    continue;
                }
                Err(ApiError::NotFound(message)) => {
                    error!(worker_id = %self.worker_id(), "Worker no longer exists on the server");
                    if self.options.show_traceback {
                        return Err(ApiError::NotFound(message).into());
                    }
                    return Err(AgentError::WorkerRemoved(self.worker_id().to_string()));
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id(), error = %e, "Failed to claim job");
                    self.idle().await;
                    continue;
                }
            };

            if self.options.push_back || self.shutdown.is_cancelled() {
                info!(job_id = %job.job_id, "Pushing job back to the queue");
                if let Err(e) = self
                    .api
                    .push_build_job(&self.queue, self.worker_id(), &job.job_id)
                    .await
                {
                    warn!(job_id = %job.job_id, error = %e, "Failed to push job back");
                }
            } else {
                let outcome = self.build(&job).await;
                self.finish(&job, outcome).await;
            }

            if self.options.run_once {
                info!(worker_id = %self.worker_id(), "Single job done, stopping");
                return Ok(());
            }
        }
    }

    /// Build one job. Never fails: errors become an `error` outcome.
    pub async fn build(&self, job: &Job) -> BuildOutcome {
        info!(job_id = %job.job_id, job_name = %job.job_name, "Starting build");
        self.journal.record(JournalEvent::Starting, job);

        match self.execute(job).await {
            Ok(exit_code) => {
                let outcome = BuildOutcome::from_exit_code(exit_code);
                info!(job_id = %job.job_id, exit_code, status = %outcome.status, "Build finished");
                self.journal.record(JournalEvent::Finished, job);
                outcome
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Build raised an error");
                self.journal.record(JournalEvent::Errored, job);
                BuildOutcome::errored()
            }
        }
    }

    async fn finish(&self, job: &Job, outcome: BuildOutcome) {
        if let Err(e) = self
            .api
            .finish_build(
                &self.queue,
                self.worker_id(),
                &job.job_id,
                outcome.status,
                outcome.failed,
            )
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "Failed to report build result");
        }
    }

    async fn execute(&self, job: &Job) -> AgentResult<i32> {
        let work_dir = self.prepare_work_dir(job).await?;
        let target = LogTarget {
            queue: self.queue.clone(),
            worker_id: self.worker_id().to_string(),
            job_id: job.job_id.clone(),
        };
        let log = BuildLog::open(
            self.transport.clone(),
            target,
            LogOptions {
                flush_interval: self.options.log_flush_interval,
                echo: self.options.echo,
            },
        );

        let result = self.run_build(job, &work_dir, &log).await;
        if let Err(e) = &result {
            log.write_str(&format!("\nBuild error: {}\n", e));
        }
        if let Err(e) = log.close().await {
            warn!(job_id = %job.job_id, error = %e, "Build log was not fully delivered");
        }

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            debug!(path = %work_dir.display(), error = %e, "Failed to remove working directory");
        }
        result
    }

    async fn run_build(&self, job: &Job, work_dir: &Path, log: &BuildLog) -> AgentResult<i32> {
        log.write_str(&format!(
            "Building {} (job {}) build {} on worker {}\n",
            job.job_name,
            job.job_id,
            job.build_number(),
            self.worker_id()
        ));
        log.write_str(&format!(
            "Host {} ({}), {} execution in {}\n",
            self.identity.hostname,
            self.identity.platform,
            self.strategy.name(),
            self.strategy.working_dir(work_dir).display()
        ));

        let source = self.stage_source(job, work_dir, log).await?;
        let context = ScriptContext {
            queue: &self.queue,
            worker_id: self.worker_id(),
            source,
            upload_command: self.options.upload_command.as_deref(),
        };
        let script_path = work_dir.join(SCRIPT_NAME);
        write_script(&script_path, &script::generate(job, &context)).await?;

        let limits = Limits {
            timeout: self.options.timeout,
            iotimeout: job
                .iotimeout
                .map(Duration::from_secs)
                .unwrap_or(self.options.iotimeout),
        };
        let exit_code = self
            .strategy
            .run(job, &script_path, log, limits, &self.shutdown)
            .await?;

        log.write_str(&format!("\nExit code: {}\n", exit_code));
        Ok(exit_code)
    }

    async fn stage_source(
        &self,
        job: &Job,
        work_dir: &Path,
        log: &BuildLog,
    ) -> AgentResult<SourceStaging> {
        if self.options.no_fetch {
            log.write_str("Skipping source fetch\n");
            return Ok(SourceStaging::None);
        }

        let tarball = work_dir.join(SOURCE_TARBALL);
        match self
            .api
            .fetch_build_source(&self.queue, self.worker_id(), &job.job_id, &tarball)
            .await
        {
            Ok(true) => Ok(SourceStaging::Tarball),
            Ok(false) | Err(ApiError::NotFound(_)) => Ok(SourceStaging::for_job(job)),
            Err(e) => Err(e.into()),
        }
    }

    async fn prepare_work_dir(&self, job: &Job) -> AgentResult<PathBuf> {
        let dir = self
            .options
            .build_dir
            .join(sanitize(self.worker_id()))
            .join(sanitize(&job.job_id));

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(path = %dir.display(), "Removed previous working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::path(&dir, e)),
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::path(&dir, e))?;
        Ok(dir)
    }
}

async fn write_script(path: &Path, contents: &str) -> AgentResult<()> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| AgentError::path(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| AgentError::path(path, e))?;
    }
    Ok(())
}

/// Keep ids usable as a single path component
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize("5f1a-b.c_d"), "5f1a-b.c_d");
        assert_eq!(sanitize("../etc/passwd"), ".._etc_passwd");
    }

    #[test]
    fn test_options_from_config() {
        let config = WorkerConfig::default();
        let options = WorkerOptions::from_config(&config);
        assert_eq!(options.poll_interval, Duration::from_secs(10));
        assert_eq!(options.iotimeout, Duration::from_secs(60));
        assert!(!options.push_back);
        assert!(options.echo);
    }
}
