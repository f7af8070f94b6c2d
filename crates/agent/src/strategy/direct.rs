use async_trait::async_trait;
use buildq_common::Job;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ExecutionStrategy;
use crate::error::AgentResult;
use crate::log_sink::OutputSink;
use crate::supervisor::{supervise, Limits};
use crate::terminator::ProcessTreeTerminator;

/// Runs the script as a direct child of the worker process
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectStrategy;

#[async_trait]
impl ExecutionStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn working_dir(&self, staged: &Path) -> PathBuf {
        staged.to_path_buf()
    }

    async fn run(
        &self,
        job: &Job,
        script: &Path,
        sink: &dyn OutputSink,
        limits: Limits,
        shutdown: &CancellationToken,
    ) -> AgentResult<i32> {
        let mut command = Command::new("bash");
        command.arg(script);
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        info!(job_id = %job.job_id, script = %script.display(), "Running build on host");
        let result = supervise(command, sink, limits, &ProcessTreeTerminator, shutdown).await?;
        Ok(result.exit_code)
    }
}
