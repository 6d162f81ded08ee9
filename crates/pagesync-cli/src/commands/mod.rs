//! Command implementations for the pagesync CLI

mod checkpoint;
mod config;
mod fetch;

pub use checkpoint::execute as manage_checkpoint;
pub use config::execute as show_config;
pub use fetch::execute as fetch;
