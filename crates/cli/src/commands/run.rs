//! Run command implementation

use anyhow::{Context, Result};
use buildq_agent::{build_strategy, IdentityStore, Journal, Worker, WorkerOptions};
use buildq_common::{BuildQueueApi, Config, HttpBuildQueue};
use colored::Colorize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cli::RunArgs;

/// Run the job loop until it stops or the user interrupts it
pub async fn execute(args: &RunArgs, mut config: Config) -> Result<()> {
    if let Some(image) = &args.image {
        config.docker.image = image.clone();
    }
    if args.allow_user_images {
        config.docker.allow_user_images = true;
    }
    if let Some(user) = &args.build_user {
        config.su.build_user = user.clone();
    }

    let api: Arc<dyn BuildQueueApi> =
        Arc::new(HttpBuildQueue::new(&config.api).context("Failed to create API client")?);
    let store = IdentityStore::new(config.worker.workers_dir());

    if args.clean {
        let identity = store
            .clean(api.as_ref(), &args.worker_id)
            .await
            .context("Failed to clean worker")?;
        println!(
            "{} Cleaned worker {}; register a new one to continue",
            "✓".green(),
            identity.worker_id.bold()
        );
        return Ok(());
    }

    let identity = store
        .load(&args.worker_id)
        .with_context(|| format!("Unknown worker '{}'", args.worker_id))?;

    let strategy = build_strategy(args.strategy, &config)
        .await
        .context("Failed to set up execution strategy")?;

    let mut options = WorkerOptions::from_config(&config.worker);
    options.push_back = args.push_back;
    options.run_once = args.one;
    options.show_traceback = args.show_traceback;
    options.no_fetch = args.no_fetch;
    if let Some(timeout) = args.timeout {
        options.timeout = timeout;
    }

    let journal = Journal::new(config.worker.journal_path());
    let worker = Worker::new(api, store, identity, strategy, journal, options);

    // A build running at Ctrl-C is killed and reported before the loop exits
    let shutdown = worker.shutdown_token();
    let worker_id = args.worker_id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(worker_id = %worker_id, "Interrupted, stopping worker");
            shutdown.cancel();
        }
    });

    info!(worker_id = %args.worker_id, strategy = %args.strategy, "Starting worker");
    worker.run().await.context("Worker stopped")?;

    Ok(())
}
