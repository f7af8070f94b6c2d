//! Execution strategies
//!
//! A strategy runs a generated build script under the supervisor. All three
//! share one contract and differ only in where the script runs:
//!
//! - [`DirectStrategy`]: a bash child of the worker on the host
//! - [`ContainerStrategy`]: a fresh docker container per build
//! - `SuStrategy` (unix): a dedicated unprivileged user, with its home reset
//!   from a skeleton before and after each build

use async_trait::async_trait;
use buildq_common::{Config, Job};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::str::FromStr;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, AgentResult};
use crate::log_sink::OutputSink;
use crate::supervisor::Limits;

mod direct;
mod docker;
#[cfg(unix)]
mod su;

pub use direct::DirectStrategy;
pub use docker::{ContainerStrategy, ContainerTerminator};
#[cfg(unix)]
pub use su::SuStrategy;

/// Runs a staged build script and reports its exit code
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Where the build runs, given the host directory it was staged in
    fn working_dir(&self, staged: &Path) -> PathBuf;

    /// Run `script` (staged inside its working directory) to completion.
    ///
    /// Build failures, timeouts and shutdowns are reported through the exit
    /// code; an error means the build could not be run at all. Cleanup still
    /// happens when `shutdown` is cancelled mid-build.
    async fn run(
        &self,
        job: &Job,
        script: &Path,
        sink: &dyn OutputSink,
        limits: Limits,
        shutdown: &CancellationToken,
    ) -> AgentResult<i32>;
}

/// Strategy selector used by the CLI and configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StrategyKind {
    #[default]
    Direct,
    Docker,
    Su,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Direct => "direct",
            StrategyKind::Docker => "docker",
            StrategyKind::Su => "su",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(StrategyKind::Direct),
            "docker" => Ok(StrategyKind::Docker),
            "su" => Ok(StrategyKind::Su),
            other => Err(AgentError::Config(format!(
                "unknown execution strategy '{}' (expected direct, docker or su)",
                other
            ))),
        }
    }
}

/// Construct and validate a strategy. Validation failures are fatal.
pub async fn build_strategy(
    kind: StrategyKind,
    config: &Config,
) -> AgentResult<Box<dyn ExecutionStrategy>> {
    match kind {
        StrategyKind::Direct => Ok(Box::new(DirectStrategy)),
        StrategyKind::Docker => Ok(Box::new(ContainerStrategy::new(&config.docker).await?)),
        #[cfg(unix)]
        StrategyKind::Su => Ok(Box::new(SuStrategy::new(&config.su).await?)),
        #[cfg(not(unix))]
        StrategyKind::Su => Err(AgentError::Config(
            "the su strategy requires a unix host".to_string(),
        )),
    }
}

/// Run a helper command to completion and fail on a non-zero status
pub(crate) async fn run_checked(program: &str, args: &[&str]) -> AgentResult<Output> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| AgentError::Spawn {
            command: program.to_string(),
            source,
        })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(AgentError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
