//! `pagesync config`

use anyhow::Result;
use pagesync_core::Config;

use crate::cli::ConfigCommand;

/// Run a config subcommand.
///
/// `explicit` is the `--config` path, when one was given.
pub fn execute(
    config: &Config,
    explicit: Option<&std::path::Path>,
    command: &ConfigCommand,
) -> Result<()> {
    match command {
        ConfigCommand::Show => print!("{}", toml::to_string_pretty(config)?),
        ConfigCommand::Path => {
            let path = match explicit {
                Some(path) => path.to_path_buf(),
                None => Config::config_path()?,
            };
            println!("{}", path.display());
        },
    }
    Ok(())
}
