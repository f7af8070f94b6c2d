//! Privilege-dropped builds
//!
//! The worker runs as root and executes each build as a dedicated build
//! user. The user's home is wiped and restored from a skeleton directory
//! before and after every build, and any process the user left behind is
//! killed once the build ends.

use async_trait::async_trait;
use buildq_common::config::SuConfig;
use buildq_common::Job;
use nix::unistd::{geteuid, User};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{run_checked, ExecutionStrategy};
use crate::error::{AgentError, AgentResult};
use crate::log_sink::OutputSink;
use crate::script::{quote, SCRIPT_NAME};
use crate::supervisor::{supervise, Limits};
use crate::terminator::ProcessTreeTerminator;

/// Runs builds as an unprivileged user through `su`
#[derive(Debug, Clone)]
pub struct SuStrategy {
    build_user: String,
    skeleton_dir: PathBuf,
    home: PathBuf,
}

impl SuStrategy {
    /// Validate the host before the worker starts taking jobs.
    ///
    /// Requires root, the worker binary under the install prefix, an existing
    /// skeleton directory, and a build user that `su` can switch to.
    pub async fn new(config: &SuConfig) -> AgentResult<Self> {
        let exe = std::env::current_exe()?;
        if !exe.starts_with(&config.install_prefix) {
            return Err(AgentError::Config(format!(
                "the worker binary must be installed under {} to run builds as another user (found {})",
                config.install_prefix.display(),
                exe.display()
            )));
        }

        if !geteuid().is_root() {
            return Err(AgentError::Config(
                "the su strategy requires the worker to run as root".to_string(),
            ));
        }

        if !config.skeleton_dir.is_dir() {
            return Err(AgentError::Config(format!(
                "skeleton directory {} does not exist",
                config.skeleton_dir.display()
            )));
        }

        let user = User::from_name(&config.build_user)
            .map_err(|e| AgentError::Config(format!("failed to look up user: {}", e)))?
            .ok_or_else(|| {
                AgentError::Config(format!("build user '{}' does not exist", config.build_user))
            })?;

        run_checked("su", &[config.build_user.as_str(), "-c", "exit 0"])
            .await
            .map_err(|e| {
                AgentError::Config(format!("cannot switch to user '{}': {}", config.build_user, e))
            })?;

        info!(user = %config.build_user, home = %user.dir.display(), "Using su execution");
        Ok(Self {
            build_user: config.build_user.clone(),
            skeleton_dir: config.skeleton_dir.clone(),
            home: user.dir,
        })
    }

    fn build_dir(&self) -> PathBuf {
        self.home.join("build")
    }

    /// Restore the build user's home from the skeleton
    async fn reset_home(&self) -> AgentResult<()> {
        match tokio::fs::remove_dir_all(&self.home).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::path(&self.home, e)),
        }
        tokio::fs::create_dir_all(&self.home)
            .await
            .map_err(|e| AgentError::path(&self.home, e))?;

        let skeleton = format!("{}/.", self.skeleton_dir.display());
        let home = self.home.to_string_lossy();
        run_checked("cp", &["-a", skeleton.as_str(), &*home]).await?;
        self.chown_home().await
    }

    async fn chown_home(&self) -> AgentResult<()> {
        let owner = format!("{}:", self.build_user);
        let home = self.home.to_string_lossy();
        run_checked("chown", &["-R", owner.as_str(), &*home]).await?;
        Ok(())
    }

    async fn stage(&self, work_dir: &Path) -> AgentResult<()> {
        let build_dir = self.build_dir();
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|e| AgentError::path(&build_dir, e))?;

        let source = format!("{}/.", work_dir.display());
        let target = build_dir.to_string_lossy();
        run_checked("cp", &["-a", source.as_str(), &*target]).await?;
        self.chown_home().await
    }

    async fn kill_user_processes(&self) {
        // pkill exits 1 when nothing matched
        match Command::new("pkill")
            .args(["-KILL", "-u", self.build_user.as_str()])
            .status()
            .await
        {
            Ok(status) if status.success() => {
                info!(user = %self.build_user, "Killed leftover build processes")
            }
            Ok(_) => debug!(user = %self.build_user, "No leftover build processes"),
            Err(e) => warn!(error = %e, "Failed to run pkill"),
        }
    }

    async fn execute(
        &self,
        script: &Path,
        sink: &dyn OutputSink,
        limits: Limits,
        shutdown: &CancellationToken,
    ) -> AgentResult<i32> {
        self.reset_home().await?;
        if let Some(work_dir) = script.parent() {
            self.stage(work_dir).await?;
        }

        let inner = format!(
            "cd {} && bash {}",
            quote(&self.build_dir().to_string_lossy()),
            SCRIPT_NAME
        );
        let mut command = Command::new("su");
        command.args(["--login", self.build_user.as_str(), "-c", inner.as_str()]);

        let result = supervise(command, sink, limits, &ProcessTreeTerminator, shutdown).await?;
        Ok(result.exit_code)
    }
}

#[async_trait]
impl ExecutionStrategy for SuStrategy {
    fn name(&self) -> &'static str {
        "su"
    }

    fn working_dir(&self, _staged: &Path) -> PathBuf {
        self.build_dir()
    }

    async fn run(
        &self,
        job: &Job,
        script: &Path,
        sink: &dyn OutputSink,
        limits: Limits,
        shutdown: &CancellationToken,
    ) -> AgentResult<i32> {
        info!(job_id = %job.job_id, user = %self.build_user, "Running build as build user");
        let result = self.execute(script, sink, limits, shutdown).await;

        self.kill_user_processes().await;
        if let Err(e) = self.reset_home().await {
            warn!(user = %self.build_user, error = %e, "Failed to reset build user home");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_binary_outside_install_prefix_is_rejected() {
        let config = SuConfig {
            build_user: "buildq".into(),
            skeleton_dir: PathBuf::from("/etc/worker-skel"),
            install_prefix: PathBuf::from("/nonexistent/buildq-prefix"),
        };

        let err = SuStrategy::new(&config).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(err.to_string().contains("/nonexistent/buildq-prefix"));
    }
}
