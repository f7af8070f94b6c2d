//! Worker identity and lifecycle
//!
//! Each registered worker has one YAML file under the workers directory,
//! keyed by its server-assigned id. The file is the single source of truth
//! for whether a worker process is currently running under that id: a
//! [`RunningGuard`] sets `running: true` for as long as it lives and clears
//! it on drop. A crash leaves the flag set until the identity is cleaned.
//!
//! The guard also holds an exclusive lock on `<worker_id>.lock`, taken
//! before the flag is read, so two processes racing to start the same worker
//! cannot both see it idle.

use buildq_common::{ApiError, BuildQueueApi, QueueName, WorkerRegistration};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::terminator::is_alive;

pub mod legacy;

const IDENTITY_EXTENSION: &str = "yaml";
const LOCK_EXTENSION: &str = "lock";

/// Persisted identity of one registered worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub username: String,
    pub queue: String,
    pub platform: String,
    pub hostname: String,
    pub dist: String,
    /// Pid of the process holding the running guard
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub running: bool,
}

impl WorkerIdentity {
    pub fn queue_name(&self) -> QueueName {
        QueueName::new(&self.username, &self.queue)
    }

    /// Running flag is set and the recorded process still exists
    pub fn is_live(&self) -> bool {
        self.running && self.pid.is_some_and(is_alive)
    }

    fn refuse_running(&self) -> AgentError {
        match self.pid {
            Some(pid) if is_alive(pid) => AgentError::AlreadyRunning {
                worker_id: self.worker_id.clone(),
                pid,
            },
            _ => AgentError::StaleIdentity(self.worker_id.clone()),
        }
    }
}

/// Directory of worker identity files
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, worker_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", worker_id, IDENTITY_EXTENSION))
    }

    fn lock_path(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", worker_id, LOCK_EXTENSION))
    }

    /// Register a new worker with the server and persist its identity.
    ///
    /// Refuses when another identity for the same queue and host is still
    /// marked running; that one must be cleaned first.
    pub async fn register(
        &self,
        api: &dyn BuildQueueApi,
        queue: &QueueName,
        registration: WorkerRegistration,
    ) -> AgentResult<WorkerIdentity> {
        for existing in self.list()? {
            if existing.running
                && existing.queue_name() == *queue
                && existing.hostname == registration.hostname
                && existing.platform == registration.platform
            {
                return Err(existing.refuse_running());
            }
        }

        let worker_id = api.register_worker(queue, &registration).await?;
        let identity = WorkerIdentity {
            worker_id,
            username: queue.username.clone(),
            queue: queue.queue.clone(),
            platform: registration.platform,
            hostname: registration.hostname,
            dist: registration.dist,
            pid: None,
            running: false,
        };

        if let Ok(previous) = self.load(&identity.worker_id) {
            if previous.running {
                warn!(worker_id = %identity.worker_id, "Server reused a worker id that is still marked running");
                return Err(previous.refuse_running());
            }
        }

        self.save(&identity)?;
        info!(worker_id = %identity.worker_id, queue = %queue, "Registered worker");
        Ok(identity)
    }

    /// Remove the worker from the server and delete its local files.
    ///
    /// A worker the server no longer knows is not an error.
    pub async fn deregister(
        &self,
        api: &dyn BuildQueueApi,
        identity: &WorkerIdentity,
    ) -> AgentResult<()> {
        match api
            .remove_worker(&identity.queue_name(), &identity.worker_id)
            .await
        {
            Ok(true) => info!(worker_id = %identity.worker_id, "Removed worker from server"),
            Ok(false) | Err(ApiError::NotFound(_)) => {
                info!(worker_id = %identity.worker_id, "Worker was already removed from server")
            }
            Err(e) => return Err(e.into()),
        }

        for path in [
            self.path(&identity.worker_id),
            self.lock_path(&identity.worker_id),
            self.dir.join(&identity.worker_id),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Deleted identity file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(AgentError::path(path, e)),
            }
        }
        Ok(())
    }

    /// Deregister an identity left marked running by a dead process.
    ///
    /// A worker whose process is still alive is never cleaned.
    pub async fn clean(
        &self,
        api: &dyn BuildQueueApi,
        worker_id: &str,
    ) -> AgentResult<WorkerIdentity> {
        let identity = self.load(worker_id)?;
        if let Some(pid) = identity.pid.filter(|_| identity.running) {
            if pid != std::process::id() && is_alive(pid) {
                return Err(AgentError::AlreadyRunning {
                    worker_id: identity.worker_id.clone(),
                    pid,
                });
            }
        }

        self.deregister(api, &identity).await?;
        Ok(identity)
    }

    /// Load an identity, falling back to the legacy per-worker file
    pub fn load(&self, worker_id: &str) -> AgentResult<WorkerIdentity> {
        let path = self.path(worker_id);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_yaml::from_str::<WorkerIdentity>(&contents) {
                Ok(identity) => return Ok(identity),
                Err(e) => warn!(path = %path.display(), error = %e, "Malformed identity file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::path(path, e)),
        }

        legacy::load(&self.dir, worker_id)
            .ok_or_else(|| AgentError::IdentityNotFound(worker_id.to_string()))
    }

    /// All identities, sorted by worker id
    pub fn list(&self) -> AgentResult<Vec<WorkerIdentity>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentError::path(&self.dir, e)),
        };

        let mut identities = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(IDENTITY_EXTENSION) {
                continue;
            }
            let contents = std::fs::read_to_string(&path).map_err(|e| AgentError::path(&path, e))?;
            match serde_yaml::from_str::<WorkerIdentity>(&contents) {
                Ok(identity) => identities.push(identity),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed identity file"),
            }
        }

        for identity in legacy::scan(&self.dir) {
            if !identities.iter().any(|i| i.worker_id == identity.worker_id) {
                identities.push(identity);
            }
        }

        identities.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(identities)
    }

    /// Write an identity file atomically
    pub fn save(&self, identity: &WorkerIdentity) -> AgentResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| AgentError::path(&self.dir, e))?;

        let path = self.path(&identity.worker_id);
        let tmp = path.with_extension("yaml.tmp");
        let contents = serde_yaml::to_string(identity)?;
        std::fs::write(&tmp, contents).map_err(|e| AgentError::path(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| AgentError::path(&path, e))?;
        Ok(())
    }

    /// Mark the worker running for the lifetime of the returned guard
    pub fn acquire(&self, worker_id: &str) -> AgentResult<RunningGuard> {
        let lock = self.lock(worker_id)?;

        let mut identity = self.load(worker_id)?;
        if identity.running {
            return Err(identity.refuse_running());
        }

        identity.running = true;
        identity.pid = Some(std::process::id());
        self.save(&identity)?;
        debug!(worker_id = %worker_id, "Acquired running guard");

        Ok(RunningGuard {
            store: self.clone(),
            identity,
            _lock: lock,
        })
    }

    /// Take the worker's lock file and record our pid in it
    fn lock(&self, worker_id: &str) -> AgentResult<File> {
        std::fs::create_dir_all(&self.dir).map_err(|e| AgentError::path(&self.dir, e))?;

        let path = self.lock_path(worker_id);
        // Not truncated until locked: the holder's pid is in there
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| AgentError::path(&path, e))?;

        if file.try_lock_exclusive().is_err() {
            let mut contents = String::new();
            let holder = file
                .read_to_string(&mut contents)
                .ok()
                .and_then(|_| contents.trim().parse::<u32>().ok());
            return Err(match holder {
                Some(pid) => AgentError::AlreadyRunning {
                    worker_id: worker_id.to_string(),
                    pid,
                },
                None => AgentError::IdentityLocked(worker_id.to_string()),
            });
        }

        file.set_len(0).map_err(|e| AgentError::path(&path, e))?;
        writeln!(file, "{}", std::process::id()).map_err(|e| AgentError::path(&path, e))?;
        Ok(file)
    }
}

/// Holds `running: true` on a worker identity until dropped
#[derive(Debug)]
pub struct RunningGuard {
    store: IdentityStore,
    identity: WorkerIdentity,
    /// Released when the guard drops, after the flag is cleared
    _lock: File,
}

impl RunningGuard {
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        // The identity may have been deregistered while running
        if !self.store.path(&self.identity.worker_id).exists() {
            return;
        }

        let mut identity = self.identity.clone();
        identity.running = false;
        identity.pid = None;
        match self.store.save(&identity) {
            Ok(()) => debug!(worker_id = %identity.worker_id, "Released running guard"),
            Err(e) => warn!(worker_id = %identity.worker_id, error = %e, "Failed to release running guard"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildq_common::fake::FakeBuildQueue;

    fn registration() -> WorkerRegistration {
        WorkerRegistration {
            platform: "linux-64".into(),
            hostname: "builder".into(),
            dist: "ubuntu-22.04".into(),
        }
    }

    fn queue() -> QueueName {
        "alice/default".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let api = FakeBuildQueue::new();

        let identity = store.register(&api, &queue(), registration()).await.unwrap();
        assert_eq!(identity.worker_id, "worker-1");
        assert!(api.has_worker("worker-1"));

        let loaded = store.load("worker-1").unwrap();
        assert_eq!(loaded, identity);
        assert!(!loaded.running);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_running_guard_sets_and_clears_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let api = FakeBuildQueue::new();
        store.register(&api, &queue(), registration()).await.unwrap();

        {
            let guard = store.acquire("worker-1").unwrap();
            assert!(guard.identity().running);
            let on_disk = store.load("worker-1").unwrap();
            assert!(on_disk.running);
            assert_eq!(on_disk.pid, Some(std::process::id()));

            // A second guard for a live worker is refused
            let err = store.acquire("worker-1").unwrap_err();
            assert!(matches!(err, AgentError::AlreadyRunning { .. }));
        }

        let released = store.load("worker-1").unwrap();
        assert!(!released.running);
        assert_eq!(released.pid, None);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_grants_one_guard() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let api = FakeBuildQueue::new();
        store.register(&api, &queue(), registration()).await.unwrap();

        for _ in 0..50 {
            let start = Arc::new(Barrier::new(8));
            let attempted = Arc::new(Barrier::new(8));
            let threads: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    let start = start.clone();
                    let attempted = attempted.clone();
                    std::thread::spawn(move || {
                        start.wait();
                        let guard = store.acquire("worker-1");
                        let acquired = guard.is_ok();
                        // Hold every guard until all threads have tried
                        attempted.wait();
                        drop(guard);
                        acquired
                    })
                })
                .collect();

            let acquired = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|acquired| *acquired)
                .count();
            assert_eq!(acquired, 1);
            assert!(!store.load("worker-1").unwrap().running);
        }
    }

    #[tokio::test]
    async fn test_lock_holder_pid_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let api = FakeBuildQueue::new();
        store.register(&api, &queue(), registration()).await.unwrap();

        let _guard = store.acquire("worker-1").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("worker-1.lock")).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        match store.acquire("worker-1").unwrap_err() {
            AgentError::AlreadyRunning { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("unexpected error: {other}"),
        }
        // Lock files are not identities
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_crashed_worker_is_stale_until_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let api = FakeBuildQueue::new();
        let mut identity = store.register(&api, &queue(), registration()).await.unwrap();

        // Simulate a crash: running with a pid that no longer exists
        identity.running = true;
        identity.pid = Some(u32::MAX - 1);
        store.save(&identity).unwrap();

        let err = store.acquire("worker-1").unwrap_err();
        assert!(matches!(err, AgentError::StaleIdentity(_)));

        let err = store
            .register(&api, &queue(), registration())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::StaleIdentity(_)));

        store.clean(&api, "worker-1").await.unwrap();
        assert!(!api.has_worker("worker-1"));
        assert!(matches!(
            store.load("worker-1").unwrap_err(),
            AgentError::IdentityNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_clean_refuses_live_worker() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let api = FakeBuildQueue::new();
        let mut identity = store.register(&api, &queue(), registration()).await.unwrap();

        let mut sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        identity.running = true;
        identity.pid = Some(sleeper.id());
        store.save(&identity).unwrap();

        let result = store.clean(&api, "worker-1").await;
        sleeper.kill().unwrap();
        sleeper.wait().unwrap();

        assert!(matches!(result, Err(AgentError::AlreadyRunning { .. })));
        assert!(api.has_worker("worker-1"));
    }

    #[tokio::test]
    async fn test_deregister_tolerates_missing_server_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let api = FakeBuildQueue::new();
        let identity = store.register(&api, &queue(), registration()).await.unwrap();

        api.remove_worker(&queue(), "worker-1").await.unwrap();
        store.deregister(&api, &identity).await.unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_load_falls_back_to_legacy_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("old-worker"),
            "username: carol\nqueue: legacy\nplatform: osx-64\nhostname: mac\n",
        )
        .unwrap();
        let store = IdentityStore::new(dir.path());

        let identity = store.load("old-worker").unwrap();
        assert_eq!(identity.queue_name().to_string(), "carol/legacy");
        assert_eq!(identity.platform, "osx-64");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_yaml_uses_legacy_or_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("w1.yaml"), ": : not yaml [").unwrap();
        let store = IdentityStore::new(dir.path());

        assert!(matches!(
            store.load("w1").unwrap_err(),
            AgentError::IdentityNotFound(_)
        ));
        assert!(store.load("missing").is_err());
    }
}
