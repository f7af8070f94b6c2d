//! Common test utilities for buildq-agent integration tests

#![allow(dead_code)]

use buildq_agent::strategy::DirectStrategy;
use buildq_agent::{IdentityStore, Journal, Worker, WorkerIdentity, WorkerOptions};
use buildq_common::fake::FakeBuildQueue;
use buildq_common::{Instructions, Job, QueueName, WorkerRegistration};
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

static INIT: Once = Once::new();

/// Initialize tracing once for all tests in a binary.
///
/// Only warnings and above are shown so expected build failures stay quiet.
pub fn init_test_tracing() {
    INIT.call_once(|| {
        use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new("warn"))
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A registered worker backed by an in-memory queue and a scratch state dir
pub struct Harness {
    pub api: Arc<FakeBuildQueue>,
    pub state: TempDir,
    pub store: IdentityStore,
    pub identity: WorkerIdentity,
}

impl Harness {
    pub async fn new() -> Self {
        init_test_tracing();

        let api = Arc::new(FakeBuildQueue::new());
        let state = TempDir::new().unwrap();
        let store = IdentityStore::new(state.path().join("workers"));
        let queue: QueueName = "alice/default".parse().unwrap();
        let identity = store
            .register(
                api.as_ref(),
                &queue,
                WorkerRegistration {
                    platform: "linux-64".into(),
                    hostname: "test-host".into(),
                    dist: "test-1".into(),
                },
            )
            .await
            .unwrap();

        Self {
            api,
            state,
            store,
            identity,
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state.path().join("journal.log")
    }

    /// Options for a worker that stops after one job
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            push_back: false,
            run_once: true,
            show_traceback: false,
            no_fetch: false,
            poll_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(60),
            iotimeout: Duration::from_secs(30),
            log_flush_interval: Duration::from_millis(50),
            echo: false,
            upload_command: None,
            build_dir: self.state.path().join("builds"),
        }
    }

    pub fn worker(&self, options: WorkerOptions) -> Worker {
        Worker::new(
            self.api.clone(),
            self.store.clone(),
            self.identity.clone(),
            Box::new(DirectStrategy),
            Journal::new(self.journal_path()),
            options,
        )
    }

    /// Section names seen in the delivered log, in order
    pub fn sections(&self) -> Vec<String> {
        self.api
            .log_text()
            .lines()
            .filter_map(|line| line.strip_prefix(buildq_agent::log_sink::SECTION_MARKER))
            .map(str::to_string)
            .collect()
    }
}

/// A job with the given instructions and otherwise empty metadata
pub fn job(job_id: &str, instructions: Instructions) -> Job {
    Job {
        job_id: job_id.into(),
        job_name: format!("{}-name", job_id),
        build_no: 1,
        sub_build_no: 0,
        platform: "linux-64".into(),
        engine: "python".into(),
        owner: "alice".into(),
        package: "demo".into(),
        env: String::new(),
        instructions,
        iotimeout: None,
        upload_token: String::new(),
        git_oauth_token: None,
        git_url: None,
        git_branch: None,
        image: None,
    }
}
