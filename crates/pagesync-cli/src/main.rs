//! pagesync CLI - resilient retrieval from offset-paginated APIs
//!
//! This is the main entry point for the pagesync command-line interface.
//! Command implementations live in [`commands`].

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use pagesync_core::Config;

mod cli;
mod commands;
mod output;
mod utils;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = utils::logging::initialize_logging(&cli) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match execute_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

async fn execute_command(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Fetch(args) => commands::fetch(config, args, cli.quiet).await,
        Commands::Checkpoint { command } => {
            commands::manage_checkpoint(config, &command)?;
            Ok(ExitCode::SUCCESS)
        },
        Commands::Config { command } => {
            commands::show_config(&config, cli.config.as_deref(), &command)?;
            Ok(ExitCode::SUCCESS)
        },
    }
}
