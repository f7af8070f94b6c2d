//! Worker configuration
//!
//! Configuration is read from YAML at `$BUILDQ_CONFIG`, or
//! `<config_dir>/buildq/config.yaml` when unset. A missing file yields the
//! defaults. A few environment variables override the file:
//!
//! - `BUILDQ_API_URL` - build queue server URL
//! - `BUILDQ_TOKEN` - API token
//! - `BUILDQ_STATE_DIR` - directory holding worker identities and the journal

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub worker: WorkerConfig,
    pub docker: DockerConfig,
    pub su: SuConfig,
}

/// Build queue server connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub token: Option<String>,
    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/api".to_string(),
            token: None,
            timeout: 30,
        }
    }
}

/// Job loop and build limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub state_dir: PathBuf,
    /// Host directory where sources and build scripts are staged
    pub build_dir: PathBuf,
    /// Seconds to sleep when the queue is empty
    pub poll_interval: u64,
    /// Maximum total build time in seconds
    pub timeout: u64,
    /// Default seconds of silence allowed before a build is killed
    pub iotimeout: u64,
    /// Seconds between background log flushes
    pub log_flush_interval: u64,
    /// Command used to upload build targets after a successful build
    pub upload_command: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".buildq");
        Self {
            state_dir: base.clone(),
            build_dir: base.join("builds"),
            poll_interval: 10,
            timeout: 3600,
            iotimeout: 60,
            log_flush_interval: 3,
            upload_command: None,
        }
    }
}

impl WorkerConfig {
    /// Directory of per-worker identity files
    pub fn workers_dir(&self) -> PathBuf {
        self.state_dir.join("workers")
    }

    /// Append-only build journal
    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("journal.log")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_secs(self.log_flush_interval)
    }
}

/// Containerized execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,
    /// Honor images requested by jobs instead of always using `image`
    pub allow_user_images: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "buildq/worker:latest".to_string(),
            allow_user_images: false,
        }
    }
}

/// Privilege-dropped execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuConfig {
    pub build_user: String,
    /// Template copied into the build user's home before and after each job
    pub skeleton_dir: PathBuf,
    /// Where the worker binary must be installed when running as root
    pub install_prefix: PathBuf,
}

impl Default for SuConfig {
    fn default() -> Self {
        Self {
            build_user: "buildq".to_string(),
            skeleton_dir: PathBuf::from("/etc/worker-skel"),
            install_prefix: PathBuf::from("/opt/buildq"),
        }
    }
}

impl Config {
    /// Load configuration from the default location plus environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let path = match env::var("BUILDQ_CONFIG") {
            Ok(path) => PathBuf::from(expand_path(&path)),
            Err(_) => dirs::config_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join("buildq")
                .join("config.yaml"),
        };

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.expand_paths();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("BUILDQ_API_URL") {
            self.api.url = url;
        }
        if let Ok(token) = env::var("BUILDQ_TOKEN") {
            self.api.token = Some(token);
        }
        if let Ok(dir) = env::var("BUILDQ_STATE_DIR") {
            self.worker.state_dir = PathBuf::from(expand_path(&dir));
        }
    }

    fn expand_paths(&mut self) {
        for path in [
            &mut self.worker.state_dir,
            &mut self.worker.build_dir,
            &mut self.su.skeleton_dir,
            &mut self.su.install_prefix,
        ] {
            let expanded = expand_path(&path.to_string_lossy());
            *path = PathBuf::from(expanded);
        }
    }
}

fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}
