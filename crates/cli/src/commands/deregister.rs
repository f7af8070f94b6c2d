//! Deregister command implementation

use anyhow::{bail, Context, Result};
use buildq_agent::IdentityStore;
use buildq_common::{Config, HttpBuildQueue};
use colored::Colorize;

use crate::cli::DeregisterArgs;

/// Remove a worker from the server and delete its identity file
pub async fn execute(args: &DeregisterArgs, config: &Config) -> Result<()> {
    let store = IdentityStore::new(config.worker.workers_dir());
    let identity = store
        .load(&args.worker_id)
        .with_context(|| format!("Unknown worker '{}'", args.worker_id))?;

    if identity.is_live() {
        bail!(
            "Worker {} is running (pid {}); stop it before deregistering",
            identity.worker_id,
            identity.pid.unwrap_or_default()
        );
    }

    let api = HttpBuildQueue::new(&config.api).context("Failed to create API client")?;
    store
        .deregister(&api, &identity)
        .await
        .context("Failed to deregister worker")?;

    println!("{} Removed worker {}", "✓".green(), identity.worker_id.bold());
    Ok(())
}
