//! Build queue names
//!
//! Queues are addressed as `username/queue`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

const QUEUE_PATTERN: &str = r"^(?P<user>[\w.-]+)/(?P<queue>[\w.-]+)$";

/// Fully-qualified build queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName {
    pub username: String,
    pub queue: String,
}

impl QueueName {
    pub fn new(username: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            queue: queue.into(),
        }
    }
}

impl FromStr for QueueName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pattern = Regex::new(QUEUE_PATTERN)
            .map_err(|_| ConfigError::InvalidQueueName(s.to_string()))?;
        let caps = pattern
            .captures(s.trim())
            .ok_or_else(|| ConfigError::InvalidQueueName(s.to_string()))?;

        Ok(Self::new(&caps["user"], &caps["queue"]))
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.queue)
    }
}
