//! Register command implementation

use anyhow::{Context, Result};
use buildq_agent::{host, IdentityStore};
use buildq_common::{Config, HttpBuildQueue, QueueName};
use colored::Colorize;
use tracing::info;

use crate::cli::RegisterArgs;

/// Register a worker for this host and print its id
pub async fn execute(args: &RegisterArgs, config: &Config) -> Result<()> {
    let queue: QueueName = args
        .queue
        .parse()
        .with_context(|| format!("Invalid queue name '{}'", args.queue))?;

    let registration = host::registration(
        args.platform.clone(),
        args.hostname.clone(),
        args.dist.clone(),
    );
    info!(
        queue = %queue,
        platform = %registration.platform,
        hostname = %registration.hostname,
        dist = %registration.dist,
        "Registering worker"
    );

    let api = HttpBuildQueue::new(&config.api).context("Failed to create API client")?;
    let store = IdentityStore::new(config.worker.workers_dir());
    let identity = store
        .register(&api, &queue, registration)
        .await
        .context("Failed to register worker")?;

    println!(
        "{} Registered worker {} on {}",
        "✓".green(),
        identity.worker_id.bold(),
        queue
    );
    println!("\nStart it with:\n  buildq run {}", identity.worker_id);
    Ok(())
}
