//! Command-line interface for runnerctl.
//!
//! Provides commands for fleet control, image checks, and remote daemon
//! leasing.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
