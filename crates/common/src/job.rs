//! Build job data model
//!
//! A [`Job`] is one unit of build work claimed from the queue. Its
//! [`Instructions`] map each build [`Phase`] to the shell commands that run
//! during that phase. Once a build finishes, its exit code is folded into a
//! [`BuildOutcome`] that is reported back to the server.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Script exit code for a build where every phase succeeded
pub const EXIT_SUCCESS: i32 = 0;
/// Script exit code for an environment/setup error (install or source staging)
pub const EXIT_ERROR: i32 = 11;
/// Script exit code for a build failure (test, before_script, or script)
pub const EXIT_FAILURE: i32 = 12;

/// A build job claimed from the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_name: String,
    #[serde(default)]
    pub build_no: u32,
    #[serde(default)]
    pub sub_build_no: u32,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub package: String,
    /// Whitespace-separated `KEY=VALUE` pairs, shell quoting allowed
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub instructions: Instructions,
    /// Seconds of silence allowed before the build is killed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iotimeout: Option<u64>,
    #[serde(default)]
    pub upload_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_oauth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    /// Container image requested by the job, honored only when allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Job {
    /// Build number in `<build_no>.<sub_build_no>` form
    pub fn build_number(&self) -> String {
        format!("{}.{}", self.build_no, self.sub_build_no)
    }
}

/// Named step of the build script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Install,
    Test,
    BeforeScript,
    Script,
    AfterSuccess,
    AfterFailure,
    AfterError,
    AfterScript,
}

impl Phase {
    /// All phases in declaration order
    pub const ALL: [Phase; 8] = [
        Phase::Install,
        Phase::Test,
        Phase::BeforeScript,
        Phase::Script,
        Phase::AfterSuccess,
        Phase::AfterFailure,
        Phase::AfterError,
        Phase::AfterScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Install => "install",
            Phase::Test => "test",
            Phase::BeforeScript => "before_script",
            Phase::Script => "script",
            Phase::AfterSuccess => "after_success",
            Phase::AfterFailure => "after_failure",
            Phase::AfterError => "after_error",
            Phase::AfterScript => "after_script",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands for a single phase: either one command or a list run in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhaseCommand {
    Single(String),
    Many(Vec<String>),
}

impl PhaseCommand {
    /// Individual commands, skipping blank entries
    pub fn commands(&self) -> Vec<&str> {
        let all: Vec<&str> = match self {
            PhaseCommand::Single(cmd) => vec![cmd.as_str()],
            PhaseCommand::Many(cmds) => cmds.iter().map(String::as_str).collect(),
        };
        all.into_iter().filter(|c| !c.trim().is_empty()).collect()
    }
}

impl From<&str> for PhaseCommand {
    fn from(cmd: &str) -> Self {
        PhaseCommand::Single(cmd.to_string())
    }
}

/// Phase name to command mapping for a job. Absent phases are no-ops.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instructions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<PhaseCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<PhaseCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_script: Option<PhaseCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PhaseCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_success: Option<PhaseCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_failure: Option<PhaseCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_error: Option<PhaseCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_script: Option<PhaseCommand>,
    /// Labels attached to every uploaded build target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upload_labels: Vec<String>,
    /// Artifacts uploaded after a successful build
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_targets: Vec<String>,
}

impl Instructions {
    /// Commands configured for a phase, if any
    pub fn get(&self, phase: Phase) -> Option<&PhaseCommand> {
        match phase {
            Phase::Install => self.install.as_ref(),
            Phase::Test => self.test.as_ref(),
            Phase::BeforeScript => self.before_script.as_ref(),
            Phase::Script => self.script.as_ref(),
            Phase::AfterSuccess => self.after_success.as_ref(),
            Phase::AfterFailure => self.after_failure.as_ref(),
            Phase::AfterError => self.after_error.as_ref(),
            Phase::AfterScript => self.after_script.as_ref(),
        }
    }

    /// Set the commands for a phase
    pub fn set(&mut self, phase: Phase, command: impl Into<PhaseCommand>) {
        let slot = match phase {
            Phase::Install => &mut self.install,
            Phase::Test => &mut self.test,
            Phase::BeforeScript => &mut self.before_script,
            Phase::Script => &mut self.script,
            Phase::AfterSuccess => &mut self.after_success,
            Phase::AfterFailure => &mut self.after_failure,
            Phase::AfterError => &mut self.after_error,
            Phase::AfterScript => &mut self.after_script,
        };
        *slot = Some(command.into());
    }
}

/// Terminal status reported for a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failure,
    Error,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Error => "error",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one build, derived from the script exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub exit_code: i32,
    pub status: BuildStatus,
    pub failed: bool,
}

impl BuildOutcome {
    /// Classify a script exit code.
    ///
    /// Only [`EXIT_FAILURE`] is a build failure; every other non-zero code
    /// (including [`EXIT_ERROR`], signals, and forced timeouts) is an error.
    pub fn from_exit_code(exit_code: i32) -> Self {
        let status = match exit_code {
            EXIT_SUCCESS => BuildStatus::Success,
            EXIT_FAILURE => BuildStatus::Failure,
            _ => BuildStatus::Error,
        };
        Self {
            exit_code,
            status,
            failed: status != BuildStatus::Success,
        }
    }

    /// Outcome for a build attempt that raised before producing an exit code
    pub fn errored() -> Self {
        Self {
            exit_code: -1,
            status: BuildStatus::Error,
            failed: true,
        }
    }
}
