//! Older single-file-per-worker identity format
//!
//! Legacy files are named by worker id with no extension and contain
//! `key: value` or `key=value` lines. The worker id comes from the file
//! name, not the contents. `queue` may hold either the bare queue name (with
//! `username` on its own line) or the combined `username/queue` form.

use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use super::WorkerIdentity;

/// Read the legacy file for `worker_id` in `dir`, if there is a usable one
pub fn load(dir: &Path, worker_id: &str) -> Option<WorkerIdentity> {
    let path = dir.join(worker_id);
    let contents = std::fs::read_to_string(&path).ok()?;
    let identity = parse(worker_id, &contents);
    if identity.is_none() {
        debug!(path = %path.display(), "Unreadable legacy worker file");
    }
    identity
}

/// Every legacy identity in `dir`
pub fn scan(dir: &Path) -> Vec<WorkerIdentity> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file() && entry.path().extension().is_none())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                return None;
            }
            load(dir, &name)
        })
        .collect()
}

pub(crate) fn parse(worker_id: &str, contents: &str) -> Option<WorkerIdentity> {
    let mut fields: HashMap<String, String> = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let split = match (line.find(':'), line.find('=')) {
            (Some(colon), Some(eq)) => Some(colon.min(eq)),
            (Some(colon), None) => Some(colon),
            (None, Some(eq)) => Some(eq),
            (None, None) => None,
        };
        if let Some(at) = split {
            let key = line[..at].trim().to_ascii_lowercase();
            let value = line[at + 1..].trim().trim_matches('"').to_string();
            fields.insert(key, value);
        }
    }

    let queue_field = fields.remove("queue")?;
    let (username, queue) = match queue_field.split_once('/') {
        Some((user, queue)) => (user.to_string(), queue.to_string()),
        None => (fields.remove("username")?, queue_field),
    };
    if username.is_empty() || queue.is_empty() {
        return None;
    }

    Some(WorkerIdentity {
        worker_id: worker_id.to_string(),
        username,
        queue,
        platform: fields.remove("platform").unwrap_or_default(),
        hostname: fields.remove("hostname").unwrap_or_default(),
        dist: fields.remove("dist").unwrap_or_default(),
        pid: fields.remove("pid").and_then(|pid| pid.parse().ok()),
        running: fields
            .remove("running")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
            .unwrap_or(false),
    })
}
