//! Shared CLI helpers

pub mod logging;
