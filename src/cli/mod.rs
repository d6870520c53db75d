//! Command-line interface for dispatch-forge.
//!
//! Provides commands for running the orchestrator, planning slot usage and
//! inspecting configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
