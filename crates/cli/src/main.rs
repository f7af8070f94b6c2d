mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose)?;

    let Some(command) = cli.command else {
        println!("No command specified. Use --help for usage information.");
        std::process::exit(1);
    };

    // Load configuration
    let config = buildq_common::Config::load().context("Failed to load configuration")?;

    let runtime = tokio::runtime::Runtime::new()?;
    match command {
        cli::Commands::Register(args) => {
            runtime.block_on(async { commands::register::execute(&args, &config).await })
        }
        cli::Commands::Deregister(args) => {
            runtime.block_on(async { commands::deregister::execute(&args, &config).await })
        }
        cli::Commands::List => commands::list::execute(&config),
        cli::Commands::Run(args) => {
            runtime.block_on(async { commands::run::execute(&args, config).await })
        }
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
