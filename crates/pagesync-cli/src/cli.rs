//! # CLI Structure and Argument Parsing
//!
//! This module defines the command-line interface for `pagesync`. The CLI is
//! built using `clap` with derive macros for automatic help generation and
//! argument validation.
//!
//! ## Usage Patterns
//!
//! ```bash
//! # Fetch every open order as JSON lines
//! pagesync fetch https://example.com/odata/Orders --filter "Status eq 'Open'" > orders.jsonl
//!
//! # Resumable run with 8 workers, written to a file
//! pagesync fetch https://example.com/odata/Orders --job orders --resume -c 8 -o orders.jsonl
//!
//! # Inspect or drop a stored checkpoint
//! pagesync checkpoint show orders
//! pagesync checkpoint clear orders
//! ```
//!
//! ## Exit Codes
//!
//! - `0`: every page was retrieved
//! - `1`: the command could not run (bad arguments, unreadable config, I/O)
//! - `2`: the fetch ended with failed pages, a timeout, or cancellation;
//!   retrieved records are still written

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Main CLI structure for the `pagesync` command
#[derive(Parser, Clone, Debug)]
#[command(name = "pagesync")]
#[command(version)]
#[command(about = "pagesync - resilient retrieval from offset-paginated APIs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Suppress informational messages (only show errors)
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable all ANSI colors in output (also respects `NO_COLOR` env)
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Path to configuration file (overrides autodiscovery). Also via `PAGESYNC_CONFIG`.
    #[arg(long, global = true, value_name = "FILE", env = "PAGESYNC_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available subcommands for the `pagesync` CLI
#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Retrieve every record matching a query
    Fetch(FetchArgs),

    /// Inspect or clear stored checkpoints
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Record output encoding
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RecordFormat {
    /// One JSON object per line
    #[default]
    Jsonl,
    /// A single JSON array
    Json,
}

/// Arguments for `pagesync fetch`
#[derive(Args, Clone, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct FetchArgs {
    /// Collection endpoint URL
    pub url: String,

    /// Filter expression, passed through verbatim
    #[arg(long)]
    pub filter: Option<String>,

    /// Fields to return (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub select: Vec<String>,

    /// Relationships to expand (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub expand: Vec<String>,

    /// Ordering term such as "CreatedAt desc" (repeatable)
    #[arg(long = "order-by", value_name = "TERM")]
    pub order_by: Vec<String>,

    /// Records per request (defaults to `sync.page_size`)
    #[arg(long = "page-size", value_name = "N")]
    pub page_size: Option<usize>,

    /// Concurrent requests (defaults to `sync.max_concurrency`)
    #[arg(short = 'c', long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Resume from the stored checkpoint and record progress
    #[arg(long)]
    pub resume: bool,

    /// Serve from and store results in the change-aware cache
    #[arg(long)]
    pub cache: bool,

    /// Write pages as they complete instead of in offset order
    #[arg(long)]
    pub streaming: bool,

    /// Failed pages tolerated before aborting (defaults to `sync.abort_threshold`)
    #[arg(long = "abort-threshold", value_name = "N")]
    pub abort_threshold: Option<usize>,

    /// Wall-clock budget for the whole fetch
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,

    /// Skip the count probe and size the run from this record count
    #[arg(long, value_name = "N")]
    pub total: Option<u64>,

    /// Warn when more than N records come back (filter sanity check)
    #[arg(long = "expect-at-most", value_name = "N")]
    pub expect_at_most: Option<u64>,

    /// Write records here instead of stdout
    #[arg(short = 'o', long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Record encoding
    #[arg(long, value_enum, default_value_t = RecordFormat::Jsonl)]
    pub format: RecordFormat,

    /// Checkpoint name (defaults to the URL)
    #[arg(long, value_name = "NAME")]
    pub job: Option<String>,
}

/// `pagesync checkpoint` subcommands
#[derive(Subcommand, Clone, Debug)]
pub enum CheckpointCommand {
    /// Print the stored checkpoint for a job
    Show {
        /// Job name (or URL when no --job was given)
        job: String,
    },
    /// Delete the stored checkpoint for a job
    Clear {
        /// Job name (or URL when no --job was given)
        job: String,
    },
}

/// `pagesync config` subcommands
#[derive(Subcommand, Clone, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file location
    Path,
}
