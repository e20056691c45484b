//! Command-line interface for brand-forge.
//!
//! Provides commands for running, resuming and inspecting brand jobs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
