//! # Output
//!
//! Records go to stdout (or `--output FILE`); progress and summaries go to
//! stderr.

mod progress;
mod records;

pub use progress::FetchProgress;
pub use records::write_records;
