//! `pagesync checkpoint`

use anyhow::Result;
use colored::Colorize;
use pagesync_core::{Config, SyncClient};

use crate::cli::CheckpointCommand;

/// Run a checkpoint subcommand.
pub fn execute(config: Config, command: &CheckpointCommand) -> Result<()> {
    let client = SyncClient::new(config)?;
    match command {
        CheckpointCommand::Show { job } => match client.checkpoint(job)? {
            Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
            None => println!("No checkpoint for '{job}'"),
        },
        CheckpointCommand::Clear { job } => {
            if client.checkpoint(job)?.is_some() {
                client.clear_checkpoint(job)?;
                println!("{} checkpoint for '{job}'", "Cleared".green());
            } else {
                println!("No checkpoint for '{job}'");
            }
        },
    }
    Ok(())
}
