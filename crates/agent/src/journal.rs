//! Append-only record of builds run by this host

use buildq_common::Job;
use chrono::{SecondsFormat, Utc};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{AgentError, AgentResult};

/// Journaled build events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    Starting,
    Finished,
    Errored,
}

impl fmt::Display for JournalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JournalEvent::Starting => "starting",
            JournalEvent::Finished => "finished",
            JournalEvent::Errored => "errored",
        })
    }
}

/// Journal file writer
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event line
    pub fn write(&self, event: JournalEvent, job: &Job) -> AgentResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::path(parent, e))?;
        }

        let line = format!(
            "{} {} job_id={} job_name={}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            event,
            job.job_id,
            job.job_name
        );

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AgentError::path(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| AgentError::path(&self.path, e))
    }

    /// Append an event, logging instead of failing
    pub fn record(&self, event: JournalEvent, job: &Job) {
        if let Err(e) = self.write(event, job) {
            warn!(job_id = %job.job_id, error = %e, "Failed to write journal");
        }
    }
}
