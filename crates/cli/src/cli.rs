//! Command-line interface definition

use buildq_agent::StrategyKind;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// buildq - build worker for a remote build queue
#[derive(Debug, Parser)]
#[command(name = "buildq", version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Register a new worker on a build queue
    Register(RegisterArgs),

    /// Remove a worker from the server and delete its local identity
    Deregister(DeregisterArgs),

    /// List workers registered from this host
    List,

    /// Run the job loop for a registered worker
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    /// Queue to serve, as username/queue
    pub queue: String,

    /// Override the detected platform (e.g. linux-64)
    #[arg(long)]
    pub platform: Option<String>,

    /// Override the detected hostname
    #[arg(long)]
    pub hostname: Option<String>,

    /// Override the detected distribution
    #[arg(long)]
    pub dist: Option<String>,
}

#[derive(Debug, Args)]
pub struct DeregisterArgs {
    /// Worker id printed by `register`
    pub worker_id: String,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Worker id printed by `register`
    pub worker_id: String,

    /// Return every claimed job to the queue without building it
    #[arg(long)]
    pub push_back: bool,

    /// Exit after one job
    #[arg(long)]
    pub one: bool,

    /// Show the raw server error if the worker has been removed
    #[arg(long)]
    pub show_traceback: bool,

    /// Deregister a stale worker left behind by a crash, then exit
    #[arg(long)]
    pub clean: bool,

    /// Do not download or clone any build source
    #[arg(long)]
    pub no_fetch: bool,

    /// Maximum build time (e.g. 90m, 2h)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Where builds run: direct, docker or su
    #[arg(long, default_value = "direct")]
    pub strategy: StrategyKind,

    /// Docker image for the docker strategy
    #[arg(long)]
    pub image: Option<String>,

    /// Let jobs choose their own docker image
    #[arg(long)]
    pub allow_user_images: bool,

    /// Build user for the su strategy
    #[arg(long)]
    pub build_user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::parse_from([
            "buildq",
            "run",
            "worker-1",
            "--one",
            "--timeout",
            "90m",
            "--strategy",
            "docker",
            "--image",
            "custom:1",
        ]);

        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.worker_id, "worker-1");
                assert!(args.one);
                assert!(!args.push_back);
                assert_eq!(args.timeout, Some(Duration::from_secs(90 * 60)));
                assert_eq!(args.strategy, StrategyKind::Docker);
                assert_eq!(args.image.as_deref(), Some("custom:1"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result = Cli::try_parse_from(["buildq", "run", "w1", "--strategy", "chroot"]);
        assert!(result.is_err());
    }
}
