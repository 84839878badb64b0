//! Command-line interface for swe-harvest.
//!
//! Provides the `mine` and `evaluate` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
